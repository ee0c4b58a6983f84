//! rasvox: volumetric geometry and segmentation for neuroimaging viewers
//!
//! This crate is the compute core beneath an interactive viewer: it derives
//! a canonical right-anterior-superior frame from heterogeneous scanner
//! header conventions, converts exactly between voxel, fraction, millimeter
//! and RAS coordinates, and runs the labeling, region growing and conform
//! resampling tools over flat voxel buffers. File parsing, rendering and
//! input handling live in the host; this crate consumes a parsed header
//! plus one sample buffer and produces matrices and labeled arrays.
//!
//! # Modules
//! - `affine`: header orientation sources resolved to a voxel-to-mm affine
//! - `orient`: RAS axis permutation/polarity and copy-free reordering
//! - `transform`: voxel/fraction/millimeter transform set and conversions
//! - `cluster`: two-pass connected-component labeling
//! - `region_grow`: constrained breadth-first flood fill
//! - `draw`: drawing sessions, pen strokes, bounded undo history
//! - `conform`: canonical isotropic reslicing with robust intensity rescale
//! - `volume`: volume data model and element types

// Geometry modules
pub mod affine;
pub mod orient;
pub mod transform;

// Segmentation modules
pub mod cluster;
pub mod region_grow;

// Interactive drawing
pub mod draw;

// Resampling
pub mod conform;

// Data model and errors
pub mod error;
pub mod volume;

pub use error::{EngineError, Result};
