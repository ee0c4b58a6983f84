//! Orientation resolution: scanner header conventions to a voxel-to-mm affine
//!
//! NIfTI headers can describe orientation four ways: a full 4x4 matrix
//! (sform), a unit quaternion plus offsets (qform), a legacy scanner
//! delta/origin/orientation-code triple, or nothing usable at all. All four
//! are modeled as one tagged source consumed by a single resolver; the
//! fallback path marks the result untrustworthy rather than failing, so
//! rendering can proceed without guaranteed anatomical fidelity.

use nalgebra::{Matrix4, Vector3};
use nifti::NiftiHeader;
use tracing::{debug, warn};

/// Spacing below this is considered degenerate and clamped.
const MIN_SPACING: f64 = 1e-6;

/// One of the four ways a header can encode orientation.
#[derive(Debug, Clone)]
pub enum OrientationSource {
    /// Validated full affine (sform).
    Matrix(Matrix4<f64>),
    /// Quaternion triple with offsets (qform). `qfac` flips the third axis
    /// when negative to preserve handedness.
    Quaternion {
        b: f64,
        c: f64,
        d: f64,
        offset: [f64; 3],
        spacing: [f64; 3],
        qfac: f64,
    },
    /// Legacy scanner convention: per-axis step, origin and orientation code.
    LegacyOrient {
        delta: [f64; 3],
        origin: [f64; 3],
        codes: [usize; 3],
    },
    /// No trustworthy source; axis-aligned from spacings only.
    SpacingOnly([f64; 3]),
}

/// A resolved voxel-to-mm affine plus its trust flag.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAffine {
    pub affine: Matrix4<f64>,
    /// True when the axis-aligned fallback was substituted. Downstream this
    /// only drives warnings, never errors.
    pub untrustworthy: bool,
}

/// Clamp a degenerate (zero, negative or non-finite) spacing.
///
/// Returns 1.0 for unusable values and at least [`MIN_SPACING`] otherwise,
/// so matrices built from spacings stay invertible. The clamp is logged.
pub fn sanitize_spacing(spacing: f64) -> f64 {
    if !spacing.is_finite() || spacing <= 0.0 {
        warn!(spacing, "degenerate voxel spacing clamped to 1.0");
        return 1.0;
    }
    if spacing < MIN_SPACING {
        warn!(spacing, "near-zero voxel spacing clamped");
        return MIN_SPACING;
    }
    spacing
}

/// Check that a spatial transform makes sense: the twelve upper cells are
/// finite and every row and column of the 3x3 submatrix has a nonzero entry.
pub fn affine_is_plausible(m: &Matrix4<f64>) -> bool {
    for i in 0..3 {
        for j in 0..4 {
            if !m[(i, j)].is_finite() {
                return false;
            }
        }
    }
    let mut row_ok = [false; 3];
    let mut col_ok = [false; 3];
    for i in 0..3 {
        for j in 0..3 {
            if m[(i, j)] != 0.0 {
                row_ok[i] = true;
                col_ok[j] = true;
            }
        }
    }
    row_ok.iter().all(|&r| r) && col_ok.iter().all(|&c| c)
}

/// Reconstruct the voxel-to-mm affine from a NIfTI qform quaternion.
///
/// The implicit scalar component is `sqrt(1 - b^2 - c^2 - d^2)`, clamped to
/// zero when rounding pushes the operand negative. Columns are scaled by the
/// voxel spacings and the third column is negated when `qfac` is negative.
pub fn quaternion_affine(
    b: f64,
    c: f64,
    d: f64,
    offset: [f64; 3],
    spacing: [f64; 3],
    qfac: f64,
) -> Matrix4<f64> {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let r = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * b * c - 2.0 * a * d,
            2.0 * b * d + 2.0 * a * c,
        ],
        [
            2.0 * b * c + 2.0 * a * d,
            a * a + c * c - b * b - d * d,
            2.0 * c * d - 2.0 * a * b,
        ],
        [
            2.0 * b * d - 2.0 * a * c,
            2.0 * c * d + 2.0 * a * b,
            a * a + d * d - c * c - b * b,
        ],
    ];
    let mut m = Matrix4::identity();
    for (i, row) in r.iter().enumerate() {
        for (j, &rij) in row.iter().enumerate() {
            let mut v = rij * spacing[j];
            if j == 2 && qfac < 0.0 {
                v = -v;
            }
            m[(i, j)] = v;
        }
        m[(i, 3)] = offset[i];
    }
    m
}

/// Convert a legacy scanner delta/origin/orientation-code triple into an
/// equivalent affine. This transcoding is exact, not approximate.
///
/// Orientation codes index pairs of anatomical directions per axis
/// (0/1 = x, 2/3 = y, 4/5 = z). Returns `None` when a code is out of range
/// or two axes collapse onto the same anatomical direction.
pub fn orient_codes_affine(
    delta: [f64; 3],
    origin: [f64; 3],
    codes: [usize; 3],
) -> Option<Matrix4<f64>> {
    const ORIENT_XYZ: [u8; 7] = [b'x', b'x', b'y', b'y', b'z', b'z', b'g'];
    let mut x_axis = usize::MAX;
    let mut y_axis = usize::MAX;
    let mut z_axis = usize::MAX;
    for (axis, &code) in codes.iter().enumerate() {
        if code >= 6 {
            return None;
        }
        match ORIENT_XYZ[code] {
            b'x' => x_axis = axis,
            b'y' => y_axis = axis,
            _ => z_axis = axis,
        }
    }
    if x_axis == usize::MAX || y_axis == usize::MAX || z_axis == usize::MAX {
        return None;
    }
    if x_axis == y_axis || x_axis == z_axis || y_axis == z_axis {
        return None;
    }
    // Legacy x/y run left/posterior-positive; NIfTI wants right/anterior, so
    // those two rows change sign.
    let mut m = Matrix4::identity();
    m[(0, x_axis)] = -delta[x_axis];
    m[(1, y_axis)] = -delta[y_axis];
    m[(2, z_axis)] = delta[z_axis];
    m[(0, 3)] = -origin[x_axis];
    m[(1, 3)] = -origin[y_axis];
    m[(2, 3)] = origin[z_axis];
    Some(m)
}

/// Axis-aligned fallback affine from (sanitized) spacings.
fn spacing_affine(spacing: [f64; 3]) -> Matrix4<f64> {
    let sx = sanitize_spacing(spacing[0]);
    let sy = sanitize_spacing(spacing[1]);
    let sz = sanitize_spacing(spacing[2]);
    #[rustfmt::skip]
    let m = Matrix4::new(
        sx, 0.0, 0.0, 0.0,
        0.0, sy, 0.0, 0.0,
        0.0, 0.0, sz, 0.0,
        0.0, 0.0, 0.0, 1.0,
    );
    m
}

/// Resolve any orientation source into a voxel-to-mm affine.
///
/// Sources that fail to produce a plausible transform fall back to the
/// axis-aligned spacing affine with the untrustworthy flag set.
pub fn resolve(source: &OrientationSource) -> ResolvedAffine {
    let (affine, fallback_spacing) = match source {
        OrientationSource::Matrix(m) => (Some(*m), [1.0, 1.0, 1.0]),
        OrientationSource::Quaternion {
            b,
            c,
            d,
            offset,
            spacing,
            qfac,
        } => (
            Some(quaternion_affine(*b, *c, *d, *offset, *spacing, *qfac)),
            *spacing,
        ),
        OrientationSource::LegacyOrient {
            delta,
            origin,
            codes,
        } => (
            orient_codes_affine(*delta, *origin, *codes),
            [delta[0].abs(), delta[1].abs(), delta[2].abs()],
        ),
        OrientationSource::SpacingOnly(spacing) => (None, *spacing),
    };
    match affine {
        Some(m) if affine_is_plausible(&m) => ResolvedAffine {
            affine: m,
            untrustworthy: false,
        },
        _ => {
            if !matches!(source, OrientationSource::SpacingOnly(_)) {
                warn!("spatial transform does not make sense, using axis-aligned fallback");
            }
            ResolvedAffine {
                affine: spacing_affine(fallback_spacing),
                untrustworthy: !matches!(source, OrientationSource::SpacingOnly(_)),
            }
        }
    }
}

/// Pick the orientation source a header actually encodes.
///
/// The matrix wins when its validity code is positive and it is plausible;
/// the quaternion wins when preferred, when the matrix is defective, or when
/// its validity code outranks the matrix's.
pub fn source_from_header(hdr: &NiftiHeader, prefer_qform: bool) -> OrientationSource {
    let sform = sform_matrix(hdr);
    let sform_ok = hdr.sform_code > 0 && affine_is_plausible(&sform);
    if prefer_qform || !sform_ok || hdr.qform_code > hdr.sform_code {
        debug!("spatial transform based on qform");
        // pixdim[0] carries qfac; zero means +1 by convention
        let qfac = if hdr.pixdim[0] == 0.0 { 1.0 } else { hdr.pixdim[0] as f64 };
        OrientationSource::Quaternion {
            b: hdr.quatern_b as f64,
            c: hdr.quatern_c as f64,
            d: hdr.quatern_d as f64,
            offset: [
                hdr.quatern_x as f64,
                hdr.quatern_y as f64,
                hdr.quatern_z as f64,
            ],
            spacing: [
                hdr.pixdim[1] as f64,
                hdr.pixdim[2] as f64,
                hdr.pixdim[3] as f64,
            ],
            qfac,
        }
    } else {
        OrientationSource::Matrix(sform)
    }
}

/// Resolve a header's orientation end to end.
pub fn resolve_header(hdr: &NiftiHeader, prefer_qform: bool) -> ResolvedAffine {
    resolve(&source_from_header(hdr, prefer_qform))
}

fn sform_matrix(hdr: &NiftiHeader) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    for j in 0..4 {
        m[(0, j)] = hdr.srow_x[j] as f64;
        m[(1, j)] = hdr.srow_y[j] as f64;
        m[(2, j)] = hdr.srow_z[j] as f64;
    }
    m
}

/// Maximum angular deviation (degrees) of any grid axis from the nearest
/// display axis. Flags acquisitions that are not axis-aligned.
///
/// Per column of the rotation submatrix the figure of merit is the dominant
/// component magnitude over the column norm; the angle comes from the worst
/// of the three. Values at or below 0.01 degrees snap to zero.
pub fn oblique_angle(m: &Matrix4<f64>) -> f64 {
    let mut fig_merit = f64::INFINITY;
    for j in 0..3 {
        let col = Vector3::new(m[(0, j)], m[(1, j)], m[(2, j)]);
        let norm = col.norm();
        if norm <= 0.0 {
            return 0.0;
        }
        let max_abs = col[0].abs().max(col[1].abs()).max(col[2].abs());
        fig_merit = fig_merit.min(max_abs / norm);
    }
    let angle = fig_merit.clamp(-1.0, 1.0).acos().to_degrees().abs();
    if angle > 0.01 {
        warn!(
            angle_degrees = angle,
            "voxels not aligned with world space"
        );
        angle
    } else {
        0.0
    }
}

/// Maximum deviation of inter-axis angles from 90 degrees; nonzero means the
/// grid axes are rhomboidal (sheared).
pub fn max_shear_degrees(m: &Matrix4<f64>) -> f64 {
    let cols: Vec<Vector3<f64>> = (0..3)
        .map(|j| Vector3::new(m[(0, j)], m[(1, j)], m[(2, j)]))
        .collect();
    let xy = (90.0 - cols[0].angle(&cols[1]).to_degrees()).abs();
    let xz = (90.0 - cols[0].angle(&cols[2]).to_degrees()).abs();
    let yz = (90.0 - cols[1].angle(&cols[2]).to_degrees()).abs();
    let shear = xy.max(xz).max(yz);
    if shear > 0.1 {
        warn!(shear_degrees = shear, "voxels are rhomboidal");
    }
    shear
}

/// Recover per-axis voxel spacing from an affine as the world-space distance
/// between adjacent voxel centers along each grid axis.
pub fn spacing_from_affine(m: &Matrix4<f64>) -> [f64; 3] {
    let mut spacing = [0.0; 3];
    for (j, s) in spacing.iter_mut().enumerate() {
        *s = Vector3::new(m[(0, j)], m[(1, j)], m[(2, j)]).norm();
    }
    spacing
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_zero_rotation_quaternion_is_diagonal() {
        // b=c=d=0 with spacings (1,2,3) must reconstruct pure scaling
        let m = quaternion_affine(0.0, 0.0, 0.0, [10.0, 20.0, 30.0], [1.0, 2.0, 3.0], 1.0);
        assert_abs_diff_eq!(m[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[(1, 1)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[(2, 2)], 3.0, epsilon = 1e-12);
        for i in 0..3 {
            for j in 0..3 {
                if i != j {
                    assert_abs_diff_eq!(m[(i, j)], 0.0, epsilon = 1e-12);
                }
            }
        }
        assert_eq!(m[(0, 3)], 10.0);
        assert_eq!(m[(1, 3)], 20.0);
        assert_eq!(m[(2, 3)], 30.0);
    }

    #[test]
    fn test_negative_qfac_flips_third_column() {
        let m = quaternion_affine(0.0, 0.0, 0.0, [0.0; 3], [1.0, 1.0, 1.0], -1.0);
        assert_abs_diff_eq!(m[(2, 2)], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_quaternion_norm_clamped() {
        // A slightly over-unit quaternion must not produce NaN
        let m = quaternion_affine(0.7072, 0.7072, 0.0, [0.0; 3], [1.0; 3], 1.0);
        for i in 0..3 {
            for j in 0..3 {
                assert!(m[(i, j)].is_finite());
            }
        }
    }

    #[test]
    fn test_affine_plausibility() {
        assert!(affine_is_plausible(&Matrix4::identity()));
        let mut zero_col = Matrix4::identity();
        zero_col[(0, 0)] = 0.0;
        assert!(!affine_is_plausible(&zero_col), "empty column must fail");
        let mut nan = Matrix4::identity();
        nan[(1, 2)] = f64::NAN;
        assert!(!affine_is_plausible(&nan));
    }

    #[test]
    fn test_header_fallback_marks_untrustworthy() {
        let mut hdr = NiftiHeader::default();
        hdr.dim = [3, 4, 4, 4, 1, 1, 1, 1];
        hdr.pixdim = [0.0, 2.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0];
        hdr.sform_code = 0;
        hdr.qform_code = 0;
        // all-zero quaternion with zero offsets still yields a plausible
        // diagonal, so break the spacings too
        hdr.pixdim[1] = 0.0;
        let resolved = resolve_header(&hdr, false);
        // quaternion path produces a defective first column (spacing 0)
        assert!(resolved.untrustworthy);
        assert!(affine_is_plausible(&resolved.affine));
        assert_eq!(resolved.affine[(0, 0)], 1.0, "zero spacing clamps to 1");
    }

    #[test]
    fn test_header_prefers_valid_sform() {
        let mut hdr = NiftiHeader::default();
        hdr.sform_code = 1;
        hdr.qform_code = 0;
        hdr.srow_x = [1.0, 0.0, 0.0, 10.0];
        hdr.srow_y = [0.0, 2.0, 0.0, 20.0];
        hdr.srow_z = [0.0, 0.0, 3.0, 30.0];
        let resolved = resolve_header(&hdr, false);
        assert!(!resolved.untrustworthy);
        assert_eq!(resolved.affine[(1, 1)], 2.0);
        assert_eq!(resolved.affine[(2, 3)], 30.0);
    }

    #[test]
    fn test_header_qform_outranks_lower_sform() {
        let mut hdr = NiftiHeader::default();
        hdr.sform_code = 1;
        hdr.qform_code = 2;
        hdr.srow_x = [5.0, 0.0, 0.0, 0.0];
        hdr.srow_y = [0.0, 5.0, 0.0, 0.0];
        hdr.srow_z = [0.0, 0.0, 5.0, 0.0];
        hdr.pixdim = [1.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0];
        let resolved = resolve_header(&hdr, false);
        // qform wins: diagonal from pixdim, not the 5mm sform
        assert_abs_diff_eq!(resolved.affine[(0, 0)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(resolved.affine[(2, 2)], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_orient_codes_exact_transcoding() {
        // identity-ish ordering: x, y, z codes with unit steps
        let m = orient_codes_affine([1.0, 1.0, 1.5], [-90.0, -126.0, -72.0], [0, 2, 4]).unwrap();
        assert_eq!(m[(0, 0)], -1.0);
        assert_eq!(m[(1, 1)], -1.0);
        assert_eq!(m[(2, 2)], 1.5);
        assert_eq!(m[(0, 3)], 90.0);
        assert_eq!(m[(1, 3)], 126.0);
        assert_eq!(m[(2, 3)], -72.0);
    }

    #[test]
    fn test_orient_codes_rejects_duplicates() {
        assert!(orient_codes_affine([1.0; 3], [0.0; 3], [0, 1, 4]).is_none());
        assert!(orient_codes_affine([1.0; 3], [0.0; 3], [0, 2, 6]).is_none());
    }

    #[test]
    fn test_oblique_angle_zero_for_axis_aligned() {
        let m = spacing_affine([1.0, 2.0, 3.0]);
        assert_eq!(oblique_angle(&m), 0.0);
    }

    #[test]
    fn test_oblique_angle_detects_rotation() {
        let theta = 10.0f64.to_radians();
        #[rustfmt::skip]
        let m = Matrix4::new(
            theta.cos(), -theta.sin(), 0.0, 0.0,
            theta.sin(), theta.cos(), 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        assert_abs_diff_eq!(oblique_angle(&m), 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shear_detection() {
        let ortho = spacing_affine([1.0; 3]);
        assert_abs_diff_eq!(max_shear_degrees(&ortho), 0.0, epsilon = 1e-9);
        let mut sheared = Matrix4::<f64>::identity();
        sheared[(0, 1)] = 0.3;
        assert!(max_shear_degrees(&sheared) > 1.0);
    }

    #[test]
    fn test_spacing_from_affine() {
        let theta = 30.0f64.to_radians();
        #[rustfmt::skip]
        let m = Matrix4::new(
            2.0 * theta.cos(), 0.0, 0.0, 0.0,
            2.0 * theta.sin(), 3.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let s = spacing_from_affine(&m);
        assert_abs_diff_eq!(s[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s[1], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sanitize_spacing() {
        assert_eq!(sanitize_spacing(2.5), 2.5);
        assert_eq!(sanitize_spacing(0.0), 1.0);
        assert_eq!(sanitize_spacing(f64::NAN), 1.0);
        assert_eq!(sanitize_spacing(-1.0), 1.0);
        assert_eq!(sanitize_spacing(1e-12), MIN_SPACING);
    }
}
