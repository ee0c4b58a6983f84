//! Common test utilities: synthetic volumes and headers

#![allow(dead_code)]

use nifti::NiftiHeader;

/// Create a binary sphere on a 3D volume.
///
/// Voxels within `radius` of the center are 1, all others 0. Uses Fortran
/// (column-major) ordering to match NIfTI convention:
/// index = x + y*nx + z*nx*ny.
pub fn sphere_volume(
    nx: usize,
    ny: usize,
    nz: usize,
    center: (f64, f64, f64),
    radius: f64,
) -> Vec<f64> {
    let mut img = vec![0.0f64; nx * ny * nz];
    let r2 = radius * radius;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let dx = i as f64 - center.0;
                let dy = j as f64 - center.1;
                let dz = k as f64 - center.2;
                if dx * dx + dy * dy + dz * dz <= r2 {
                    img[i + j * nx + k * nx * ny] = 1.0;
                }
            }
        }
    }
    img
}

/// A linear intensity ramp along the flat index.
pub fn ramp_volume(nvox: usize) -> Vec<f64> {
    (0..nvox).map(|i| i as f64).collect()
}

/// Header with a validated sform matrix.
pub fn sform_header(dims: (u16, u16, u16), spacing: (f32, f32, f32)) -> NiftiHeader {
    let mut hdr = NiftiHeader::default();
    hdr.dim = [3, dims.0, dims.1, dims.2, 1, 1, 1, 1];
    hdr.pixdim = [1.0, spacing.0, spacing.1, spacing.2, 0.0, 0.0, 0.0, 0.0];
    hdr.sform_code = 1;
    hdr.qform_code = 0;
    hdr.srow_x = [spacing.0, 0.0, 0.0, -(dims.0 as f32) * spacing.0 / 2.0];
    hdr.srow_y = [0.0, spacing.1, 0.0, -(dims.1 as f32) * spacing.1 / 2.0];
    hdr.srow_z = [0.0, 0.0, spacing.2, -(dims.2 as f32) * spacing.2 / 2.0];
    hdr.datatype = 16;
    hdr.scl_slope = 1.0;
    hdr.scl_inter = 0.0;
    hdr
}

/// Header carrying only a qform quaternion (zero rotation).
pub fn qform_header(dims: (u16, u16, u16), spacing: (f32, f32, f32)) -> NiftiHeader {
    let mut hdr = NiftiHeader::default();
    hdr.dim = [3, dims.0, dims.1, dims.2, 1, 1, 1, 1];
    hdr.pixdim = [1.0, spacing.0, spacing.1, spacing.2, 0.0, 0.0, 0.0, 0.0];
    hdr.sform_code = 0;
    hdr.qform_code = 1;
    hdr.quatern_b = 0.0;
    hdr.quatern_c = 0.0;
    hdr.quatern_d = 0.0;
    hdr.quatern_x = -10.0;
    hdr.quatern_y = -20.0;
    hdr.quatern_z = -30.0;
    hdr.datatype = 16;
    hdr.scl_slope = 1.0;
    hdr.scl_inter = 0.0;
    hdr
}

/// Count nonzero samples in a labeled/drawn buffer.
pub fn count_nonzero<T: PartialEq + Default>(img: &[T]) -> usize {
    let zero = T::default();
    img.iter().filter(|v| **v != zero).count()
}
