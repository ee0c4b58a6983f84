//! Interactive drawing sessions over a background volume
//!
//! A session owns the 8-bit drawing bitmap (values 0-255 denote pen or
//! segmentation classes), sized to the background volume at session start
//! and discarded at close. Pen strokes and flood fills mutate it in place;
//! snapshots go into a bounded undo ring. Combined with the background
//! header's dims and affine, the bitmap round-trips through persistence
//! unchanged in content.
//!
//! The session assumes at most one in-flight mutation; hosts with real
//! parallelism must serialize writers per bitmap.

pub mod pen;
pub mod undo;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::orient::RasOrientation;
use crate::region_grow::{self, GrowOptions, GrowOutcome};
use crate::transform::TransformSet;

use self::pen::PenPlane;
use self::undo::UndoRing;

/// Default number of undo snapshots retained.
pub const DEFAULT_UNDO_DEPTH: usize = 8;

/// A live drawing over one background volume.
#[derive(Debug, Clone)]
pub struct DrawingSession {
    dims: [usize; 3],
    bitmap: Vec<u8>,
    undo: UndoRing,
    /// When false, committed drawing reasserts over later fills at snapshot
    /// time (fills never overwrite pen work).
    pub fill_overwrites: bool,
}

impl DrawingSession {
    /// Open an empty drawing sized to the background volume.
    pub fn open(dims: [usize; 3]) -> Self {
        Self::with_undo_depth(dims, DEFAULT_UNDO_DEPTH)
    }

    /// Open with an explicit undo capacity.
    pub fn with_undo_depth(dims: [usize; 3], depth: usize) -> Self {
        let nvox = dims[0] * dims[1] * dims[2];
        let bitmap = vec![0u8; nvox];
        let mut undo = UndoRing::new(depth);
        undo.push(&bitmap);
        Self {
            dims,
            bitmap,
            undo,
            fill_overwrites: true,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.bitmap
    }

    /// Consume the session, keeping the drawn bitmap.
    pub fn into_bitmap(self) -> Vec<u8> {
        self.bitmap
    }

    /// Replace the drawing with an externally supplied bitmap already in
    /// this session's voxel order.
    ///
    /// A length mismatch rejects the load synchronously so the host can
    /// surface a message without crashing.
    pub fn load_bitmap(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.bitmap.len() {
            return Err(EngineError::dimension_mismatch(self.bitmap.len(), data.len()));
        }
        self.bitmap.copy_from_slice(data);
        self.snapshot();
        Ok(())
    }

    /// Load a bitmap stored in the background's native voxel order,
    /// reordering it into RAS through the orientation stride table.
    pub fn load_native_bitmap(&mut self, data: &[u8], orient: &RasOrientation) -> Result<()> {
        let native_nvox =
            orient.native_dims[0] * orient.native_dims[1] * orient.native_dims[2];
        if data.len() != native_nvox {
            return Err(EngineError::dimension_mismatch(native_nvox, data.len()));
        }
        if orient.dims != self.dims {
            return Err(EngineError::dimension_mismatch(
                self.bitmap.len(),
                data.len(),
            ));
        }
        let [ox, oy, oz] = orient.dims;
        let mut j = 0usize;
        for z in 0..oz {
            for y in 0..oy {
                for x in 0..ox {
                    self.bitmap[j] = data[orient.native_index(x, y, z)];
                    j += 1;
                }
            }
        }
        self.snapshot();
        Ok(())
    }

    /// Record the current state in the undo ring.
    ///
    /// With `fill_overwrites` off, nonzero voxels from the previous snapshot
    /// reassert over the current bitmap first.
    pub fn snapshot(&mut self) {
        if !self.fill_overwrites {
            if let Some(prev) = self.undo.latest(self.bitmap.len()) {
                for (dst, &old) in self.bitmap.iter_mut().zip(prev.iter()) {
                    if old > 0 {
                        *dst = old;
                    }
                }
            }
        }
        self.undo.push(&self.bitmap);
    }

    /// Step back to the previous snapshot. Returns false when history is
    /// exhausted; that is a logged no-op, never an error.
    pub fn undo(&mut self) -> bool {
        match self.undo.step_back(self.bitmap.len()) {
            Some(prev) => {
                self.bitmap = prev;
                true
            }
            None => {
                debug!("no undo state left");
                false
            }
        }
    }

    /// Paint one pen dab.
    pub fn draw_point(&mut self, pt: [i64; 3], value: u8, pen_size: usize, plane: PenPlane) {
        pen::draw_point(&mut self.bitmap, self.dims, pt, value, pen_size, plane);
    }

    /// Rasterize a pen stroke between two voxels.
    pub fn draw_line(
        &mut self,
        pt_a: [i64; 3],
        pt_b: [i64; 3],
        value: u8,
        pen_size: usize,
        plane: PenPlane,
    ) {
        pen::draw_line(&mut self.bitmap, self.dims, pt_a, pt_b, value, pen_size, plane);
    }

    /// Run a constrained flood fill against the committed bitmap and
    /// snapshot the result.
    pub fn flood_fill(
        &mut self,
        background: &[f64],
        transforms: &TransformSet,
        seed: [i64; 3],
        opts: &GrowOptions,
    ) -> Result<GrowOutcome> {
        let outcome = region_grow::region_grow(
            &mut self.bitmap,
            background,
            self.dims,
            transforms,
            seed,
            opts,
        )?;
        if outcome.filled > 0 {
            self.snapshot();
        }
        Ok(outcome)
    }

    /// Run the identical fill against a disposable copy for live preview
    /// (e.g. click-to-segment before commit); the committed state is
    /// untouched until [`DrawingSession::apply_preview`].
    pub fn preview_flood_fill(
        &self,
        background: &[f64],
        transforms: &TransformSet,
        seed: [i64; 3],
        opts: &GrowOptions,
    ) -> Result<(Vec<u8>, GrowOutcome)> {
        let mut scratch = self.bitmap.clone();
        let outcome = region_grow::region_grow(
            &mut scratch,
            background,
            self.dims,
            transforms,
            seed,
            opts,
        )?;
        Ok((scratch, outcome))
    }

    /// Commit a previewed bitmap.
    pub fn apply_preview(&mut self, preview: &[u8]) -> Result<()> {
        if preview.len() != self.bitmap.len() {
            return Err(EngineError::dimension_mismatch(
                self.bitmap.len(),
                preview.len(),
            ));
        }
        self.bitmap.copy_from_slice(preview);
        self.snapshot();
        Ok(())
    }

    /// Erase the whole drawing.
    pub fn clear(&mut self) {
        self.bitmap.fill(0);
        self.snapshot();
    }
}
