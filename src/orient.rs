//! RAS axis permutation and polarity
//!
//! Scanners store voxel grids in any of 48 axis orders. Inspecting the sign
//! and dominant magnitude of each affine column tells which voxel axis best
//! aligns with each of Right/Anterior/Superior; the result is a
//! reorder-and-flip table that lets the rest of the engine present data in
//! RAS order without copying the buffer.

use nalgebra::Matrix4;

use crate::affine;

/// How a native voxel grid maps onto RAS order.
#[derive(Debug, Clone)]
pub struct RasOrientation {
    /// Signed 1-based permutation: entry `w` names the native voxel axis
    /// feeding RAS axis `w`, negated when that axis runs the wrong way.
    pub perm: [i8; 3],
    /// Native dimensions (nx, ny, nz).
    pub native_dims: [usize; 3],
    /// Dimensions in RAS order.
    pub dims: [usize; 3],
    /// Spacing in RAS order (mm).
    pub spacing: [f64; 3],
    /// RAS-ordered voxel to millimeter affine.
    pub mat_ras: Matrix4<f64>,
    /// Native voxel index to RAS voxel index (reorder-and-flip).
    pub to_ras_vox: Matrix4<f64>,
    /// Native-buffer stride per RAS axis (signed; negative when flipped).
    pub step: [isize; 3],
    /// Native-buffer offset per RAS axis; the native linear index of RAS
    /// voxel (x,y,z) is `start[0]+start[1]+start[2] + x*step[0] + y*step[1]
    /// + z*step[2]`.
    pub start: [isize; 3],
    /// Maximum angular deviation of any grid axis from plumb, degrees.
    pub oblique_angle: f64,
    /// Maximum deviation of inter-axis angles from 90 degrees; nonzero
    /// means rhomboidal voxels.
    pub max_shear_deg: f64,
}

impl RasOrientation {
    /// True when the grid is already in RAS order with no flips.
    pub fn is_identity(&self) -> bool {
        self.perm == [1, 2, 3]
    }

    /// Native linear index of the RAS-ordered voxel (x, y, z).
    pub fn native_index(&self, x: usize, y: usize, z: usize) -> usize {
        let idx = self.start[0]
            + self.start[1]
            + self.start[2]
            + x as isize * self.step[0]
            + y as isize * self.step[1]
            + z as isize * self.step[2];
        idx as usize
    }
}

/// Infer the RAS permutation of a voxel grid from its affine.
///
/// # Arguments
/// * `affine` - Native voxel to mm transform
/// * `dims` - Native dimensions (nx, ny, nz)
/// * `spacing` - Native spacing in mm
pub fn infer(affine: &Matrix4<f64>, dims: [usize; 3], spacing: [f64; 3]) -> RasOrientation {
    let a = affine;
    let abs = |i: usize, j: usize| a[(i, j)].abs();

    // Dominant world axis of each voxel column, 1-based. The third is
    // constrained: the indices must sum to 1+2+3.
    let mut ixyz = [1usize, 1, 1];
    if abs(1, 0) > abs(0, 0) {
        ixyz[0] = 2;
    }
    if abs(2, 0) > abs(0, 0) && abs(2, 0) > abs(1, 0) {
        ixyz[0] = 3;
    }
    ixyz[1] = if ixyz[0] == 1 {
        if abs(1, 1) > abs(2, 1) {
            2
        } else {
            3
        }
    } else if ixyz[0] == 2 {
        if abs(0, 1) > abs(2, 1) {
            1
        } else {
            3
        }
    } else if abs(0, 1) > abs(1, 1) {
        1
    } else {
        2
    };
    ixyz[2] = 6 - ixyz[1] - ixyz[0];

    // perm[w] = native voxel axis feeding world axis w (1-based)
    let mut perm = [1usize, 2, 3];
    perm[ixyz[0] - 1] = 1;
    perm[ixyz[1] - 1] = 2;
    perm[ixyz[2] - 1] = 3;

    // Permute columns so the rotation becomes (nearly) diagonal, then read
    // polarity off the diagonal.
    let mut r = *a;
    for i in 0..3 {
        for j in 0..3 {
            r[(i, j)] = a[(i, perm[j] - 1)];
        }
    }
    let flip = [r[(0, 0)] < 0.0, r[(1, 1)] < 0.0, r[(2, 2)] < 0.0];

    let dims_ras = [dims[perm[0] - 1], dims[perm[1] - 1], dims[perm[2] - 1]];
    let spacing_ras = [
        spacing[perm[0] - 1],
        spacing[perm[1] - 1],
        spacing[perm[2] - 1],
    ];
    let mut signed_perm = [perm[0] as i8, perm[1] as i8, perm[2] as i8];
    for (p, &f) in signed_perm.iter_mut().zip(flip.iter()) {
        if f {
            *p = -*p;
        }
    }

    let identity = signed_perm == [1, 2, 3];
    let (mat_ras, to_ras_vox) = if identity {
        (*a, Matrix4::identity())
    } else {
        // Flip matrix is an involution: x -> (dim-1) - x on flipped axes.
        let mut flip_m = Matrix4::identity();
        for w in 0..3 {
            if flip[w] {
                flip_m[(w, w)] = -1.0;
                flip_m[(w, 3)] = (dims_ras[w] - 1) as f64;
            }
        }
        let mat_ras = r * flip_m;

        // Native voxel -> RAS voxel reorder-and-flip table.
        let mut t = Matrix4::identity();
        for w in 0..3 {
            for j in 0..3 {
                t[(w, j)] = 0.0;
            }
            t[(w, perm[w] - 1)] = if flip[w] { -1.0 } else { 1.0 };
            t[(w, 3)] = if flip[w] { (dims_ras[w] - 1) as f64 } else { 0.0 };
        }
        (mat_ras, t)
    };

    // Stride/start table for traversing the native buffer in RAS order.
    let in_step = [1isize, dims[0] as isize, (dims[0] * dims[1]) as isize];
    let mut step = [0isize; 3];
    let mut start = [0isize; 3];
    for w in 0..3 {
        step[w] = in_step[perm[w] - 1];
        if flip[w] {
            start[w] = step[w] * (dims_ras[w] - 1) as isize;
            step[w] = -step[w];
        }
    }

    let oblique_angle = affine::oblique_angle(&mat_ras);
    let max_shear_deg = affine::max_shear_degrees(&mat_ras);

    RasOrientation {
        perm: signed_perm,
        native_dims: dims,
        dims: dims_ras,
        spacing: spacing_ras,
        mat_ras,
        to_ras_vox,
        step,
        start,
        oblique_angle,
        max_shear_deg,
    }
}

/// Materialize a RAS-ordered copy of a native-order buffer.
///
/// The copy-free stride table covers most consumers; this is for callers
/// that want a contiguous RAS buffer (e.g. persisting a reoriented volume).
pub fn reorder_to_ras(img: &[f64], orient: &RasOrientation) -> Vec<f64> {
    if orient.is_identity() {
        return img.to_vec();
    }
    let [ox, oy, oz] = orient.dims;
    let mut out = vec![0.0; ox * oy * oz];
    let mut j = 0;
    for z in 0..oz {
        let zi = orient.start[2] + z as isize * orient.step[2];
        for y in 0..oy {
            let yi = orient.start[1] + y as isize * orient.step[1];
            for x in 0..ox {
                let xi = orient.start[0] + x as isize * orient.step[0];
                out[j] = img[(xi + yi + zi) as usize];
                j += 1;
            }
        }
    }
    out
}
