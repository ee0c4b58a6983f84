//! Voxel / fraction / millimeter coordinate conversions
//!
//! Builds and caches the full transform set for a volume: RAS voxel to mm
//! (and its exact inverse), normalized fraction to mm, the de-obliqued
//! orthogonal display variant, and the native/RAS voxel reorder matrices.
//! Inverses are computed once at build time.

use nalgebra::{Matrix4, Vector4};
use tracing::warn;

use crate::orient::RasOrientation;

/// Cached 4x4 transforms between the coordinate spaces of one volume.
///
/// Invariants: composing `frac2mm` with the fraction-of-voxel map equals
/// `vox2mm` within floating tolerance, and `vox2mm * mm2vox` is the
/// identity. Rebuilt whenever the header's orientation fields or the
/// quaternion preference change.
#[derive(Debug, Clone)]
pub struct TransformSet {
    /// RAS-ordered voxel to millimeter.
    pub vox2mm: Matrix4<f64>,
    /// Millimeter to RAS-ordered voxel (exact inverse of `vox2mm`).
    pub mm2vox: Matrix4<f64>,
    /// Normalized fraction [0..1]^3 to millimeter.
    pub frac2mm: Matrix4<f64>,
    /// Millimeter to normalized fraction.
    pub mm2frac: Matrix4<f64>,
    /// Orthogonal (de-obliqued) fraction to millimeter display variant.
    pub frac2mm_ortho: Matrix4<f64>,
    /// Inverse of the orthogonal variant.
    pub mm2frac_ortho: Matrix4<f64>,
    /// Native voxel order to RAS voxel order.
    pub to_ras_vox: Matrix4<f64>,
    /// RAS voxel order back to native voxel order.
    pub from_ras_vox: Matrix4<f64>,
    /// RAS-ordered dimensions.
    pub dims: [usize; 3],
    /// RAS-ordered spacing in mm.
    pub spacing: [f64; 3],
    /// True when a degenerate matrix had to be clamped to stay invertible.
    pub clamped: bool,
}

/// Invert, substituting an epsilon-scaled diagonal when the matrix is
/// singular. The substitution is logged, never silent.
fn invert_or_clamp(m: &Matrix4<f64>, spacing: [f64; 3], clamped: &mut bool) -> Matrix4<f64> {
    if let Some(inv) = m.try_inverse() {
        if inv.iter().all(|v| v.is_finite()) {
            return inv;
        }
    }
    *clamped = true;
    warn!("non-invertible transform, substituting axis-aligned epsilon scale");
    let mut d = Matrix4::identity();
    for (i, &s) in spacing.iter().enumerate() {
        d[(i, i)] = s.abs().max(1e-6);
        d[(i, 3)] = m[(i, 3)];
    }
    d.try_inverse().unwrap_or_else(Matrix4::identity)
}

impl TransformSet {
    /// Build all transforms for an oriented volume.
    pub fn build(orient: &RasOrientation) -> Self {
        let dims = orient.dims;
        let spacing = orient.spacing;
        let vox2mm = orient.mat_ras;
        let mut clamped = false;
        let mm2vox = invert_or_clamp(&vox2mm, spacing, &mut clamped);

        // Fraction to voxel: v = frac * (dim - 1), so fraction 0 is the
        // first voxel and fraction 1 the last.
        let extent = |i: usize| (dims[i].max(2) - 1) as f64;
        let mut frac2vox_m = Matrix4::identity();
        for i in 0..3 {
            frac2vox_m[(i, i)] = extent(i);
        }
        let frac2mm = vox2mm * frac2vox_m;
        let mm2frac = invert_or_clamp(&frac2mm, spacing, &mut clamped);

        // Orthographic variant: axis-aligned scaling positioned so the world
        // origin projects to the same fraction as in the oblique transform.
        let origin = mm2vox * Vector4::new(0.0, 0.0, 0.0, 1.0);
        let mut frac2mm_ortho = Matrix4::identity();
        for i in 0..3 {
            frac2mm_ortho[(i, i)] = spacing[i] * extent(i);
            frac2mm_ortho[(i, 3)] = -origin[i] * spacing[i];
        }
        let mm2frac_ortho = invert_or_clamp(&frac2mm_ortho, spacing, &mut clamped);

        let to_ras_vox = orient.to_ras_vox;
        let from_ras_vox = invert_or_clamp(&to_ras_vox, [1.0; 3], &mut clamped);

        Self {
            vox2mm,
            mm2vox,
            frac2mm,
            mm2frac,
            frac2mm_ortho,
            mm2frac_ortho,
            to_ras_vox,
            from_ras_vox,
            dims,
            spacing,
            clamped,
        }
    }

    fn apply(m: &Matrix4<f64>, p: [f64; 3]) -> [f64; 3] {
        let v = m * Vector4::new(p[0], p[1], p[2], 1.0);
        [v[0], v[1], v[2]]
    }

    /// Voxel location to millimeter coordinates.
    pub fn vox2mm_point(&self, vox: [f64; 3]) -> [f64; 3] {
        Self::apply(&self.vox2mm, vox)
    }

    /// Millimeter coordinates to fractional voxel location.
    pub fn mm2vox_frac(&self, mm: [f64; 3]) -> [f64; 3] {
        Self::apply(&self.mm2vox, mm)
    }

    /// Millimeter coordinates to the nearest voxel index.
    pub fn mm2vox_point(&self, mm: [f64; 3]) -> [i64; 3] {
        let v = self.mm2vox_frac(mm);
        [
            v[0].round() as i64,
            v[1].round() as i64,
            v[2].round() as i64,
        ]
    }

    /// Voxel index to normalized fraction: fraction 0 is the first voxel,
    /// fraction 1 the last.
    pub fn vox2frac(&self, vox: [f64; 3]) -> [f64; 3] {
        [
            vox[0] / (self.dims[0].max(2) - 1) as f64,
            vox[1] / (self.dims[1].max(2) - 1) as f64,
            vox[2] / (self.dims[2].max(2) - 1) as f64,
        ]
    }

    /// Normalized fraction to the nearest voxel index.
    pub fn frac2vox(&self, frac: [f64; 3]) -> [i64; 3] {
        [
            (frac[0] * (self.dims[0].max(2) - 1) as f64).round() as i64,
            (frac[1] * (self.dims[1].max(2) - 1) as f64).round() as i64,
            (frac[2] * (self.dims[2].max(2) - 1) as f64).round() as i64,
        ]
    }

    /// Normalized fraction to millimeter, through the oblique transform or
    /// the orthogonal display variant.
    pub fn frac2mm_point(&self, frac: [f64; 3], ortho: bool) -> [f64; 3] {
        if ortho {
            Self::apply(&self.frac2mm_ortho, frac)
        } else {
            Self::apply(&self.frac2mm, frac)
        }
    }

    /// Millimeter to normalized fraction.
    pub fn mm2frac_point(&self, mm: [f64; 3], ortho: bool) -> [f64; 3] {
        if ortho {
            Self::apply(&self.mm2frac_ortho, mm)
        } else {
            Self::apply(&self.mm2frac, mm)
        }
    }

    /// True when the voxel index is inside the RAS grid.
    pub fn in_bounds(&self, vox: [i64; 3]) -> bool {
        (0..3).all(|i| vox[i] >= 0 && (vox[i] as usize) < self.dims[i])
    }
}
