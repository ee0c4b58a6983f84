//! Conform resampling: reslice any volume onto a canonical isotropic grid
//!
//! Computes the output grid's affine and the bidirectional voxel-to-voxel
//! mapping, resamples with nearest-neighbor or trilinear interpolation, and
//! applies a robust intensity rescale into the destination range. The
//! default output is 256x256x256 at 1 mm regardless of input geometry, in
//! LIA order like FreeSurfer or in RAS on request.

use nalgebra::{Matrix4, Vector4};
use tracing::{debug, warn};

use crate::error::Result;
use crate::volume::{ElementType, VoxelVolume};

/// Options for one conform pass.
#[derive(Debug, Clone, Copy)]
pub struct ConformOptions {
    /// Output grid size per axis.
    pub out_dim: usize,
    /// Output voxel size in mm.
    pub out_mm: f64,
    /// Output in RAS axis order instead of LIA.
    pub to_ras: bool,
    /// Trilinear rather than nearest-neighbor interpolation.
    pub linear: bool,
    /// Emit float samples rather than rounding into uint8.
    pub as_float: bool,
    /// Clamp intensity with the robust ~2%..98% window instead of the
    /// FreeSurfer 0%..99.99% window.
    pub robust: bool,
}

impl Default for ConformOptions {
    fn default() -> Self {
        Self {
            out_dim: 256,
            out_mm: 1.0,
            to_ras: false,
            linear: true,
            as_float: false,
            robust: false,
        }
    }
}

/// Compute the output affine and the voxel-to-voxel mappings for a conform.
///
/// The output direction matrix is canonical (LIA or RAS) scaled by the
/// output voxel size; the translation aligns the centers of the two grids in
/// world space.
///
/// # Returns
/// `(out_affine, out_to_in, in_to_out)` where `out_to_in` maps an output
/// voxel index to the corresponding input voxel coordinate.
pub fn conform_vox2vox(
    in_dims: [usize; 3],
    in_affine: &Matrix4<f64>,
    out_dim: usize,
    out_mm: f64,
    to_ras: bool,
) -> (Matrix4<f64>, Matrix4<f64>, Matrix4<f64>) {
    // Canonical output direction cosines.
    #[rustfmt::skip]
    let mdc = if to_ras {
        Matrix4::<f64>::identity()
    } else {
        // LIA: columns run right-to-left, superior-to-inferior,
        // posterior-to-anterior
        Matrix4::new(
            -1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, -1.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    };

    let half_in = Vector4::new(
        in_dims[0] as f64 / 2.0,
        in_dims[1] as f64 / 2.0,
        in_dims[2] as f64 / 2.0,
        1.0,
    );
    let in_center = in_affine * half_in;

    let mut out_affine = mdc * out_mm;
    out_affine[(3, 3)] = 1.0;
    let half_out = out_dim as f64 / 2.0;
    let out_center = out_affine * Vector4::new(half_out, half_out, half_out, 0.0);
    for i in 0..3 {
        out_affine[(i, 3)] = in_center[i] - out_center[i];
    }

    let in_inv = in_affine.try_inverse().unwrap_or_else(|| {
        warn!("input affine is singular, conform mapping degrades to identity");
        Matrix4::identity()
    });
    let out_to_in = in_inv * out_affine;
    let in_to_out = out_to_in.try_inverse().unwrap_or_else(Matrix4::identity);
    (out_affine, out_to_in, in_to_out)
}

/// Histogram-based intensity window: find the source value range holding
/// the `[f_low, f_high]` fraction of samples, and the linear scale mapping
/// it onto `[dst_min, dst_max]`.
///
/// # Returns
/// `(src_min, scale)` such that `dst = dst_min + scale * (v - src_min)`.
pub fn intensity_scale(
    img: &[f64],
    dst_min: f64,
    dst_max: f64,
    f_low: f64,
    f_high: f64,
) -> (f64, f64) {
    let mut src_min = f64::INFINITY;
    let mut src_max = f64::NEG_INFINITY;
    let mut n = 0usize;
    for &v in img {
        if !v.is_finite() {
            continue;
        }
        src_min = src_min.min(v);
        src_max = src_max.max(v);
        n += 1;
    }
    if n == 0 || src_max <= src_min {
        warn!("no intensity variability, scale degrades to unity");
        return (if src_min.is_finite() { src_min } else { 0.0 }, 1.0);
    }

    let (mut lo, mut hi) = (src_min, src_max);
    if f_low > 0.0 || f_high < 1.0 {
        const BINS: usize = 1000;
        let bin_width = (src_max - src_min) / BINS as f64;
        let mut hist = vec![0usize; BINS];
        for &v in img {
            if !v.is_finite() {
                continue;
            }
            let bin = (((v - src_min) / bin_width) as usize).min(BINS - 1);
            hist[bin] += 1;
        }
        let n_low = (f_low * n as f64) as usize;
        let n_high = (f_high * n as f64).ceil() as usize;
        let mut cum = 0usize;
        let mut lo_set = n_low == 0;
        for (b, &count) in hist.iter().enumerate() {
            cum += count;
            if !lo_set && cum > n_low {
                lo = src_min + b as f64 * bin_width;
                lo_set = true;
            }
            if cum >= n_high {
                hi = src_min + (b + 1) as f64 * bin_width;
                break;
            }
        }
    }
    if hi <= lo {
        warn!("degenerate intensity window, scale degrades to unity");
        return (lo, 1.0);
    }
    let scale = (dst_max - dst_min) / (hi - lo);
    debug!(lo, hi, scale, "intensity window estimated");
    (lo, scale)
}

/// Apply a linear scale/offset, clamping into the destination range; the
/// integer path rounds before truncation.
pub fn scale_crop(
    img: &[f64],
    dst_min: f64,
    dst_max: f64,
    src_min: f64,
    scale: f64,
    round_to_int: bool,
) -> Vec<f64> {
    img.iter()
        .map(|&v| {
            let mut val = dst_min + scale * (v - src_min);
            val = val.clamp(dst_min, dst_max);
            if round_to_int {
                val = val.round();
            }
            val
        })
        .collect()
}

#[inline]
fn sample_nearest(img: &[f64], dims: [usize; 3], p: [f64; 3]) -> f64 {
    let x = p[0].round();
    let y = p[1].round();
    let z = p[2].round();
    if x < 0.0 || y < 0.0 || z < 0.0 {
        return 0.0;
    }
    let (x, y, z) = (x as usize, y as usize, z as usize);
    if x >= dims[0] || y >= dims[1] || z >= dims[2] {
        return 0.0;
    }
    img[x + y * dims[0] + z * dims[0] * dims[1]]
}

#[inline]
fn sample_trilinear(img: &[f64], dims: [usize; 3], p: [f64; 3]) -> f64 {
    if !(p[0].is_finite() && p[1].is_finite() && p[2].is_finite()) {
        return 0.0;
    }
    let x0f = p[0].floor();
    let y0f = p[1].floor();
    let z0f = p[2].floor();
    if x0f < 0.0 || y0f < 0.0 || z0f < 0.0 {
        return 0.0;
    }
    let (x0, y0, z0) = (x0f as usize, y0f as usize, z0f as usize);
    if x0 >= dims[0] || y0 >= dims[1] || z0 >= dims[2] {
        return 0.0;
    }
    let x1 = (x0 + 1).min(dims[0] - 1);
    let y1 = (y0 + 1).min(dims[1] - 1);
    let z1 = (z0 + 1).min(dims[2] - 1);
    let fx = p[0] - x0f;
    let fy = p[1] - y0f;
    let fz = p[2] - z0f;

    let nx = dims[0];
    let nxy = dims[0] * dims[1];
    let at = |x: usize, y: usize, z: usize| img[x + y * nx + z * nxy];

    let c00 = at(x0, y0, z0) * (1.0 - fx) + at(x1, y0, z0) * fx;
    let c01 = at(x0, y1, z0) * (1.0 - fx) + at(x1, y1, z0) * fx;
    let c10 = at(x0, y0, z1) * (1.0 - fx) + at(x1, y0, z1) * fx;
    let c11 = at(x0, y1, z1) * (1.0 - fx) + at(x1, y1, z1) * fx;
    let c0 = c00 * (1.0 - fy) + c01 * fy;
    let c1 = c10 * (1.0 - fy) + c11 * fy;
    c0 * (1.0 - fz) + c1 * fz
}

/// Reslice a volume onto the canonical conform grid.
///
/// Every output sample is pulled through the voxel-to-voxel matrix with the
/// selected interpolation; samples falling outside the input grid become 0.
/// Intensities are rescaled into 0..255 through the percentile-clipped
/// source window, rounded when emitting uint8.
pub fn conform(volume: &VoxelVolume, opts: &ConformOptions) -> Result<VoxelVolume> {
    let in_dims = volume.dims3();
    let (out_affine, out_to_in, _) = conform_vox2vox(
        in_dims,
        &volume.affine,
        opts.out_dim,
        opts.out_mm,
        opts.to_ras,
    );

    let element = if opts.as_float {
        ElementType::Float32
    } else {
        ElementType::Uint8
    };
    let frame = &volume.data[..volume.nvox()];
    let (f_low, f_high) = if opts.robust { (0.02, 0.98) } else { (0.0, 0.9999) };
    // float output keeps the uint8 destination window, like FreeSurfer
    let (dst_min, dst_max) = element.integer_range().unwrap_or((0.0, 255.0));
    let (src_min, scale) = intensity_scale(frame, dst_min, dst_max, f_low, f_high);

    let od = opts.out_dim;
    let mut out = vec![0.0; od * od * od];
    let mut i = 0usize;
    for z in 0..od {
        for y in 0..od {
            for x in 0..od {
                let p = out_to_in * Vector4::new(x as f64, y as f64, z as f64, 1.0);
                let p = [p[0], p[1], p[2]];
                out[i] = if opts.linear {
                    sample_trilinear(frame, in_dims, p)
                } else {
                    sample_nearest(frame, in_dims, p)
                };
                i += 1;
            }
        }
    }

    let out = scale_crop(&out, dst_min, dst_max, src_min, scale, element.is_integer());
    let mut conformed =
        VoxelVolume::from_parts([od, od, od], [opts.out_mm; 3], element, out)?;
    conformed.affine = out_affine;
    conformed.untrustworthy = volume.untrustworthy;
    debug!(out_dim = od, out_mm = opts.out_mm, "conform complete");
    Ok(conformed)
}

/// Robust display range for a volume.
#[derive(Debug, Clone, Copy)]
pub struct RobustRange {
    /// Percentile-clipped low intensity (scaled units).
    pub robust_min: f64,
    /// Percentile-clipped high intensity.
    pub robust_max: f64,
    /// Full minimum (scaled units).
    pub global_min: f64,
    /// Full maximum.
    pub global_max: f64,
}

/// Percentile-clipped intensity range resistant to outliers.
///
/// Mirrors the FSL robust-range estimate: a 1001-bin histogram is walked
/// from both ends until `percentile_frac` of the samples is consumed; when
/// the two cursors collide (most samples share one value) they widen back
/// out to the nearest occupied bins. NaN samples are ignored; zeros are
/// optionally excluded so empty space does not dominate the window.
///
/// # Arguments
/// * `img` - Raw sample values
/// * `slope`, `inter` - Linear rescale applied to the returned bounds
/// * `percentile_frac` - Fraction clipped from each tail (e.g. 0.02)
/// * `ignore_zero` - Exclude exact zeros from the histogram
pub fn robust_range(
    img: &[f64],
    slope: f64,
    inter: f64,
    percentile_frac: f64,
    ignore_zero: bool,
) -> RobustRange {
    let scaled = |raw: f64| raw * slope + inter;
    let mut mn = f64::INFINITY;
    let mut mx = f64::NEG_INFINITY;
    let mut n_zero = 0usize;
    let mut n_nan = 0usize;
    for &v in img {
        if v.is_nan() {
            n_nan += 1;
            continue;
        }
        if v == 0.0 {
            n_zero += 1;
            if ignore_zero {
                continue;
            }
        }
        mn = mn.min(v);
        mx = mx.max(v);
    }
    if !mn.is_finite() || !mx.is_finite() {
        return RobustRange {
            robust_min: 0.0,
            robust_max: 0.0,
            global_min: 0.0,
            global_max: 0.0,
        };
    }
    if !ignore_zero {
        n_zero = 0;
    }
    n_zero += n_nan;

    let n2pct = ((img.len() - n_zero) as f64 * percentile_frac).round() as usize;
    if n2pct < 1 || mn == mx {
        debug!("no variability in image intensity");
        return RobustRange {
            robust_min: scaled(mn),
            robust_max: scaled(mx),
            global_min: scaled(mn),
            global_max: scaled(mx),
        };
    }

    const BINS: usize = 1001;
    let scl = (BINS - 1) as f64 / (mx - mn);
    let mut hist = vec![0usize; BINS];
    for &v in img {
        if v.is_nan() || (ignore_zero && v == 0.0) {
            continue;
        }
        hist[((v - mn) * scl).round() as usize] += 1;
    }

    let mut n = 0usize;
    let mut lo = 0usize;
    while n < n2pct {
        n += hist[lo];
        lo += 1;
    }
    lo -= 1;
    n = 0;
    let mut hi = BINS;
    while n < n2pct {
        hi -= 1;
        n += hist[hi];
    }
    if lo == hi {
        // the majority shares one bin: widen to the nearest occupied bins
        let mut ok = false;
        while !ok {
            if lo > 0 {
                lo -= 1;
                if hist[lo] > 0 {
                    ok = true;
                }
            }
            if !ok && hi < BINS - 1 {
                hi += 1;
                if hist[hi] > 0 {
                    ok = true;
                }
            }
            if lo == 0 && hi == BINS - 1 {
                ok = true;
            }
        }
    }
    RobustRange {
        robust_min: scaled(lo as f64 / scl + mn),
        robust_max: scaled(hi as f64 / scl + mn),
        global_min: scaled(mn),
        global_max: scaled(mx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn centered_affine(dims: [usize; 3], mm: f64) -> Matrix4<f64> {
        let mut m = Matrix4::identity() * mm;
        m[(3, 3)] = 1.0;
        for i in 0..3 {
            m[(i, 3)] = -(dims[i] as f64) * mm / 2.0;
        }
        m
    }

    #[test]
    fn test_default_output_geometry() {
        let data = vec![50.0; 8 * 8 * 8];
        let mut vol =
            VoxelVolume::from_parts([8, 8, 8], [3.0; 3], ElementType::Float64, data).unwrap();
        vol.affine = centered_affine([8, 8, 8], 3.0);
        let out = conform(&vol, &ConformOptions::default()).unwrap();
        assert_eq!(out.dims3(), [256, 256, 256]);
        assert_eq!(out.spacing3(), [1.0, 1.0, 1.0]);
        assert_eq!(out.element, ElementType::Uint8);
    }

    #[test]
    fn test_vox2vox_identity_when_grids_match() {
        let dims = [256, 256, 256];
        let affine = centered_affine(dims, 1.0);
        let (out_affine, out_to_in, in_to_out) =
            conform_vox2vox(dims, &affine, 256, 1.0, true);
        for i in 0..4 {
            for j in 0..4 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(out_to_in[(i, j)], expect, epsilon = 1e-9);
                assert_abs_diff_eq!(in_to_out[(i, j)], expect, epsilon = 1e-9);
                assert_abs_diff_eq!(out_affine[(i, j)], affine[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_vox2vox_lia_directions() {
        let dims = [64, 64, 64];
        let affine = centered_affine(dims, 1.0);
        let (out_affine, _, _) = conform_vox2vox(dims, &affine, 256, 1.0, false);
        // column i points left, column j inferior, column k anterior
        assert_eq!(out_affine[(0, 0)], -1.0);
        assert_eq!(out_affine[(2, 1)], -1.0);
        assert_eq!(out_affine[(1, 2)], 1.0);
        // world center preserved
        let c_in = affine * Vector4::new(32.0, 32.0, 32.0, 1.0);
        let c_out = out_affine * Vector4::new(128.0, 128.0, 128.0, 1.0);
        for i in 0..3 {
            assert_abs_diff_eq!(c_in[i], c_out[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_centers_align_for_anisotropic_input() {
        let dims = [90, 110, 72];
        #[rustfmt::skip]
        let affine = Matrix4::new(
            0.0, 0.0, -2.5, 80.0,
            -0.94, 0.0, 0.0, 40.0,
            0.0, 1.2, 0.0, -30.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let (out_affine, out_to_in, _) = conform_vox2vox(dims, &affine, 256, 1.0, false);
        let c_in = affine * Vector4::new(45.0, 55.0, 36.0, 1.0);
        let c_out = out_affine * Vector4::new(128.0, 128.0, 128.0, 1.0);
        for i in 0..3 {
            assert_abs_diff_eq!(c_in[i], c_out[i], epsilon = 1e-9);
        }
        // output grid center maps onto input grid center
        let p = out_to_in * Vector4::new(128.0, 128.0, 128.0, 1.0);
        assert_abs_diff_eq!(p[0], 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p[1], 55.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p[2], 36.0, epsilon = 1e-9);
    }

    #[test]
    fn test_conform_preserves_aligned_samples() {
        // matched grids: the resample is an identity copy, scaling maps the
        // foreground block to 255
        let dims = [8, 8, 8];
        let mut data = vec![0.0; 512];
        for z in 3..5 {
            for y in 3..5 {
                for x in 3..5 {
                    data[x + y * 8 + z * 64] = 100.0;
                }
            }
        }
        let mut vol =
            VoxelVolume::from_parts(dims, [2.0; 3], ElementType::Float64, data).unwrap();
        vol.affine = centered_affine(dims, 2.0);
        let opts = ConformOptions {
            out_dim: 8,
            out_mm: 2.0,
            to_ras: true,
            linear: false,
            ..ConformOptions::default()
        };
        let out = conform(&vol, &opts).unwrap();
        assert_eq!(out.data[4 + 4 * 8 + 4 * 64], 255.0);
        assert_eq!(out.data[0], 0.0);
    }

    #[test]
    fn test_out_of_bounds_samples_are_background() {
        // tiny input inside a big output grid: corners must be 0
        let data = vec![100.0; 8];
        let mut vol =
            VoxelVolume::from_parts([2, 2, 2], [1.0; 3], ElementType::Float64, data).unwrap();
        vol.affine = centered_affine([2, 2, 2], 1.0);
        let opts = ConformOptions {
            out_dim: 16,
            out_mm: 1.0,
            to_ras: true,
            ..ConformOptions::default()
        };
        let out = conform(&vol, &opts).unwrap();
        assert_eq!(out.data[0], 0.0);
        assert_eq!(out.data[16 * 16 * 16 - 1], 0.0);
        assert!(out.data.iter().any(|&v| v > 0.0), "interior survives");
    }

    #[test]
    fn test_scale_crop_rounds_and_clamps() {
        let img = vec![-10.0, 0.0, 50.0, 100.0, 500.0];
        let out = scale_crop(&img, 0.0, 255.0, 0.0, 2.55, true);
        assert_eq!(out, vec![0.0, 0.0, 128.0, 255.0, 255.0]);
        let float_out = scale_crop(&img, 0.0, 255.0, 0.0, 2.55, false);
        assert_abs_diff_eq!(float_out[2], 127.5, epsilon = 1e-12);
    }

    #[test]
    fn test_intensity_scale_percentiles_on_ramp() {
        let img: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let (src_min, scale) = intensity_scale(&img, 0.0, 255.0, 0.02, 0.98);
        assert!(
            (src_min - 20.0).abs() < 2.0,
            "2nd percentile of a 0..999 ramp is ~20, got {}",
            src_min
        );
        let hi = src_min + 255.0 / scale;
        assert!((hi - 980.0).abs() < 3.0, "98th percentile ~980, got {}", hi);
    }

    #[test]
    fn test_intensity_scale_flat_volume() {
        let img = vec![7.0; 100];
        let (src_min, scale) = intensity_scale(&img, 0.0, 255.0, 0.0, 0.9999);
        assert_eq!(src_min, 7.0);
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn test_robust_range_covers_96_percent() {
        let img: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let r = robust_range(&img, 1.0, 0.0, 0.02, false);
        let inside = img
            .iter()
            .filter(|&&v| v >= r.robust_min && v <= r.robust_max)
            .count();
        assert!(
            (940..=980).contains(&inside),
            "expected ~96% of samples inside the window, got {}",
            inside
        );
        assert_eq!(r.global_min, 0.0);
        assert_eq!(r.global_max, 999.0);
    }

    #[test]
    fn test_robust_range_resists_outliers() {
        let mut img: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        img.extend(std::iter::repeat(-5000.0).take(10));
        img.extend(std::iter::repeat(5000.0).take(10));
        let r = robust_range(&img, 1.0, 0.0, 0.02, false);
        assert!(r.robust_min > -100.0, "low outliers clipped: {}", r.robust_min);
        assert!(r.robust_max < 1100.0, "high outliers clipped: {}", r.robust_max);
        assert_eq!(r.global_min, -5000.0);
        assert_eq!(r.global_max, 5000.0);
    }

    #[test]
    fn test_robust_range_applies_rescale() {
        let img: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let r = robust_range(&img, 2.0, 10.0, 0.02, false);
        assert_abs_diff_eq!(r.global_min, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(r.global_max, 208.0, epsilon = 1e-9);
    }

    #[test]
    fn test_robust_range_ignore_zero() {
        let mut img = vec![0.0; 900];
        img.extend((1..=100).map(|i| i as f64));
        let with_zeros = robust_range(&img, 1.0, 0.0, 0.02, false);
        let without = robust_range(&img, 1.0, 0.0, 0.02, true);
        assert!(without.robust_min > with_zeros.robust_min);
        assert!(without.robust_min >= 1.0);
    }

    #[test]
    fn test_nearest_and_trilinear_sampling() {
        let dims = [2, 2, 2];
        let img = vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0];
        assert_eq!(sample_nearest(&img, dims, [1.0, 0.0, 0.0]), 10.0);
        assert_eq!(sample_nearest(&img, dims, [-1.0, 0.0, 0.0]), 0.0);
        assert_eq!(sample_nearest(&img, dims, [0.0, 0.0, 2.1]), 0.0);
        // midpoint of all eight corners
        let mid = sample_trilinear(&img, dims, [0.5, 0.5, 0.5]);
        assert_abs_diff_eq!(mid, 35.0, epsilon = 1e-12);
        assert_eq!(sample_trilinear(&img, dims, [2.5, 0.0, 0.0]), 0.0);
        assert_eq!(sample_trilinear(&img, dims, [f64::NAN, 0.0, 0.0]), 0.0);
    }
}
