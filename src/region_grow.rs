//! Seeded region growing for interactive labeling
//!
//! A queue-based breadth-first flood fill (never recursive, so call depth is
//! bounded on multi-million-sample grids) with intensity, geometric and
//! connectivity constraints. Discovery state lives in the very buffer being
//! grown: 1 marks a candidate, 2 marks a discovered voxel, and a
//! finalization pass rewrites the sentinels to the target label, avoiding a
//! second full-size buffer.

use std::collections::VecDeque;

use tracing::debug;

use crate::cluster::Connectivity;
use crate::error::{EngineError, Result};
use crate::transform::TransformSet;

/// Candidate sentinel in the working buffer.
const CANDIDATE: u8 = 1;
/// Discovered-but-not-final sentinel.
const DISCOVERED: u8 = 2;

/// Neighbor offsets ordered face, edge, corner so a connectivity prefix
/// selects the right set.
#[rustfmt::skip]
const NEIGHBOR_OFFSETS: [[i32; 3]; 26] = [
    // faces
    [0, 0, -1], [0, 0, 1], [0, -1, 0], [0, 1, 0], [-1, 0, 0], [1, 0, 0],
    // edges
    [-1, -1, 0], [1, -1, 0], [-1, 1, 0], [1, 1, 0],
    [0, -1, -1], [0, 1, -1], [-1, 0, -1], [1, 0, -1],
    [0, -1, 1], [0, 1, 1], [-1, 0, 1], [1, 0, 1],
    // corners
    [-1, -1, -1], [1, -1, -1], [-1, 1, -1], [1, 1, -1],
    [-1, -1, 1], [1, -1, 1], [-1, 1, 1], [1, 1, 1],
];

/// Neighbor offsets for a connectivity level.
pub fn neighbor_offsets(conn: Connectivity) -> &'static [[i32; 3]] {
    &NEIGHBOR_OFFSETS[..conn.neighbor_count()]
}

#[inline]
fn vx2xyz(vx: usize, nx: usize, nxy: usize) -> [usize; 3] {
    let z = vx / nxy;
    let rem = vx - z * nxy;
    [rem % nx, rem / nx, z]
}

/// Breadth-first growth over candidate voxels.
///
/// Voxels holding the candidate sentinel that connect to the seed become
/// discovered. Work is bounded by the number of samples ever enqueued,
/// O(volume size) in the worst case.
pub fn flood_fill_core(img: &mut [u8], seed: usize, dims: [usize; 3], conn: Connectivity) {
    let nx = dims[0];
    let nxy = dims[0] * dims[1];
    let offsets = neighbor_offsets(conn);

    let mut queue = VecDeque::new();
    img[seed] = DISCOVERED;
    queue.push_back(seed);

    while let Some(vx) = queue.pop_front() {
        let [x, y, z] = vx2xyz(vx, nx, nxy);
        for off in offsets {
            let xn = x as i32 + off[0];
            let yn = y as i32 + off[1];
            let zn = z as i32 + off[2];
            if xn < 0 || yn < 0 || zn < 0 {
                continue;
            }
            let (xn, yn, zn) = (xn as usize, yn as usize, zn as usize);
            if xn >= dims[0] || yn >= dims[1] || zn >= dims[2] {
                continue;
            }
            let vxn = xn + yn * nx + zn * nxy;
            if img[vxn] != CANDIDATE {
                continue;
            }
            img[vxn] = DISCOVERED;
            queue.push_back(vxn);
        }
    }
}

/// What drives candidate selection during growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowMode {
    /// Flood voxels sharing the seed's drawn color.
    SameColor,
    /// Flood background-image voxels inside the inclusive intensity window.
    IntensityWindow,
    /// Dilate an existing same-color cluster toward brighter intensities;
    /// never removes voxels already selected.
    GrowBrighter,
    /// Dilate an existing same-color cluster toward darker intensities.
    GrowDarker,
}

/// Parameters for one region-growing operation.
#[derive(Debug, Clone, Copy)]
pub struct GrowOptions {
    /// Label to paint; 0 erases.
    pub target: u8,
    pub mode: GrowMode,
    /// Inclusive lower intensity bound (window mode, or an explicit override
    /// of the derived bound in grow modes).
    pub intensity_min: f64,
    /// Inclusive upper intensity bound.
    pub intensity_max: f64,
    pub connectivity: Connectivity,
    /// Maximum Euclidean distance from the seed in millimeters.
    pub max_distance_mm: f64,
    /// Restrict growth to the seed's own 2D plane on this RAS axis.
    pub plane_axis: Option<usize>,
}

impl Default for GrowOptions {
    fn default() -> Self {
        Self {
            target: 1,
            mode: GrowMode::SameColor,
            intensity_min: f64::NEG_INFINITY,
            intensity_max: f64::INFINITY,
            connectivity: Connectivity::Faces,
            max_distance_mm: f64::INFINITY,
            plane_axis: None,
        }
    }
}

/// Outcome of a region-growing operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowOutcome {
    /// Number of voxels rewritten to the target label.
    pub filled: usize,
}

/// Grow a region from a seed and paint it into `bitmap`.
///
/// The bitmap holds drawn classes (0 = unlabeled), `background` the
/// intensities growth constraints are evaluated against. An out-of-bounds
/// seed is a no-op, not an error. Repeated runs with identical inputs paint
/// bit-identical sets: candidate marking scans in raster order and the
/// breadth-first wave visits neighbors in a fixed order.
///
/// Callers wanting a live preview run this against a disposable copy of the
/// committed bitmap and apply it on confirmation.
///
/// # Arguments
/// * `bitmap` - Drawing bitmap, mutated in place
/// * `background` - Background image intensities, same extent
/// * `dims` - Volume dimensions (nx, ny, nz)
/// * `transforms` - Transform set used for millimeter-distance checks
/// * `seed` - Seed voxel, may be out of bounds
/// * `opts` - Growth constraints
pub fn region_grow(
    bitmap: &mut [u8],
    background: &[f64],
    dims: [usize; 3],
    transforms: &TransformSet,
    seed: [i64; 3],
    opts: &GrowOptions,
) -> Result<GrowOutcome> {
    let nx = dims[0];
    let nxy = dims[0] * dims[1];
    let nxyz = nxy * dims[2];
    if bitmap.len() != nxyz {
        return Err(EngineError::dimension_mismatch(nxyz, bitmap.len()));
    }
    if background.len() != nxyz {
        return Err(EngineError::dimension_mismatch(nxyz, background.len()));
    }

    let in_bounds = (0..3).all(|i| seed[i] >= 0 && (seed[i] as usize) < dims[i]);
    if !in_bounds {
        debug!(?seed, "region grow seed out of bounds, ignoring");
        return Ok(GrowOutcome::default());
    }
    let seed = [seed[0] as usize, seed[1] as usize, seed[2] as usize];
    let seed_vx = seed[0] + seed[1] * nx + seed[2] * nxy;
    let seed_color = bitmap[seed_vx];

    if opts.mode == GrowMode::SameColor && seed_color == opts.target {
        debug!("selected voxel already carries the target label");
        return Ok(GrowOutcome::default());
    }

    // Geometric reach: the seed's plane and a millimeter radius.
    let seed_mm = transforms.vox2mm_point([seed[0] as f64, seed[1] as f64, seed[2] as f64]);
    let max_dist2 = opts.max_distance_mm * opts.max_distance_mm;
    let unconstrained = opts.plane_axis.is_none() && !opts.max_distance_mm.is_finite();
    let within_reach = |vx: usize| -> bool {
        if unconstrained {
            return true;
        }
        let xyz = vx2xyz(vx, nx, nxy);
        if let Some(axis) = opts.plane_axis {
            if xyz[axis] != seed[axis] {
                return false;
            }
        }
        if opts.max_distance_mm.is_finite() {
            let mm = transforms.vox2mm_point([xyz[0] as f64, xyz[1] as f64, xyz[2] as f64]);
            let d2 = (mm[0] - seed_mm[0]).powi(2)
                + (mm[1] - seed_mm[1]).powi(2)
                + (mm[2] - seed_mm[2]).powi(2);
            if d2 > max_dist2 {
                return false;
            }
        }
        true
    };

    let mut img = vec![0u8; nxyz];
    match opts.mode {
        GrowMode::SameColor => {
            if seed_color != 0 {
                for (i, slot) in img.iter_mut().enumerate() {
                    if bitmap[i] == seed_color && within_reach(i) {
                        *slot = CANDIDATE;
                    }
                }
            }
        }
        GrowMode::IntensityWindow => {
            for (i, slot) in img.iter_mut().enumerate() {
                let v = background[i];
                if v >= opts.intensity_min && v <= opts.intensity_max && within_reach(i) {
                    *slot = CANDIDATE;
                }
            }
            if img[seed_vx] != CANDIDATE {
                debug!("seed outside the intensity window, nothing to grow");
                return Ok(GrowOutcome::default());
            }
        }
        GrowMode::GrowBrighter | GrowMode::GrowDarker => {
            if seed_color == 0 {
                debug!("grow cluster needs a seed on an existing selection");
                return Ok(GrowOutcome::default());
            }
            // Discover the seed's cluster first, then derive the intensity
            // bound from its mean.
            let mut cluster = vec![0u8; nxyz];
            for (i, slot) in cluster.iter_mut().enumerate() {
                if bitmap[i] == seed_color {
                    *slot = CANDIDATE;
                }
            }
            flood_fill_core(&mut cluster, seed_vx, dims, opts.connectivity);
            let mut sum = 0.0;
            let mut n = 0usize;
            for (i, &c) in cluster.iter().enumerate() {
                if c == DISCOVERED {
                    sum += background[i];
                    n += 1;
                }
            }
            let base = if n > 0 { sum / n as f64 } else { background[seed_vx] };
            let explicit = opts.intensity_min.is_finite() && opts.intensity_max.is_finite();
            let (lo, hi) = if explicit {
                (opts.intensity_min, opts.intensity_max)
            } else if opts.mode == GrowMode::GrowBrighter {
                (base, f64::INFINITY)
            } else {
                (f64::NEG_INFINITY, base)
            };
            for (i, slot) in img.iter_mut().enumerate() {
                if cluster[i] == DISCOVERED {
                    // the existing selection always stays
                    *slot = CANDIDATE;
                } else if bitmap[i] == 0 {
                    let v = background[i];
                    if v >= lo && v <= hi && within_reach(i) {
                        *slot = CANDIDATE;
                    }
                }
            }
        }
    }

    flood_fill_core(&mut img, seed_vx, dims, opts.connectivity);

    // Finalize: rewrite discovered sentinels to the committed label.
    let mut filled = 0usize;
    for (i, &state) in img.iter().enumerate() {
        if state == DISCOVERED {
            bitmap[i] = opts.target;
            filled += 1;
        }
    }
    debug!(filled, "region grow complete");
    Ok(GrowOutcome { filled })
}

/// One-ring binary dilation: every unlabeled voxel adjacent to the selection
/// takes the value of its first labeled neighbor in offset order. Growth is
/// capped at a single neighbor ring.
pub fn dilate_one_ring(bitmap: &mut [u8], dims: [usize; 3], conn: Connectivity) -> usize {
    let nx = dims[0];
    let nxy = dims[0] * dims[1];
    let snapshot = bitmap.to_vec();
    let offsets = neighbor_offsets(conn);
    let mut grown = 0usize;
    for vx in 0..snapshot.len() {
        if snapshot[vx] != 0 {
            continue;
        }
        let [x, y, z] = vx2xyz(vx, nx, nxy);
        for off in offsets {
            let xn = x as i32 + off[0];
            let yn = y as i32 + off[1];
            let zn = z as i32 + off[2];
            if xn < 0 || yn < 0 || zn < 0 {
                continue;
            }
            let (xn, yn, zn) = (xn as usize, yn as usize, zn as usize);
            if xn >= dims[0] || yn >= dims[1] || zn >= dims[2] {
                continue;
            }
            let neighbor = snapshot[xn + yn * nx + zn * nxy];
            if neighbor != 0 {
                bitmap[vx] = neighbor;
                grown += 1;
                break;
            }
        }
    }
    grown
}
