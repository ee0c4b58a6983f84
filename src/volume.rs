//! Core volume data model
//!
//! A volume is one flat numeric buffer in Fortran (column-major) order to
//! match NIfTI convention: index = x + y*nx + z*nx*ny (+ t*nx*ny*nz for 4D).
//! Sample values are held as f64 regardless of the stored element type; the
//! declared element type is retained so downstream consumers (e.g. the
//! conform rescaler) know the representable destination range.

use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Matrix4;
use nifti::NiftiHeader;

use crate::affine;
use crate::error::{EngineError, Result};

/// Sample element types, mirroring NIfTI datatype codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Uint8,
    Int8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl ElementType {
    /// Map a NIfTI datatype code to an element type.
    ///
    /// Returns `None` for codes this engine does not handle (RGB, complex,
    /// bitfields).
    pub fn from_nifti_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Self::Uint8),
            4 => Some(Self::Int16),
            8 => Some(Self::Int32),
            16 => Some(Self::Float32),
            64 => Some(Self::Float64),
            256 => Some(Self::Int8),
            512 => Some(Self::Uint16),
            768 => Some(Self::Uint32),
            1024 => Some(Self::Int64),
            1280 => Some(Self::Uint64),
            _ => None,
        }
    }

    /// NIfTI datatype code for this element type.
    pub fn nifti_code(self) -> i16 {
        match self {
            Self::Uint8 => 2,
            Self::Int16 => 4,
            Self::Int32 => 8,
            Self::Float32 => 16,
            Self::Float64 => 64,
            Self::Int8 => 256,
            Self::Uint16 => 512,
            Self::Uint32 => 768,
            Self::Int64 => 1024,
            Self::Uint64 => 1280,
        }
    }

    /// True for integer-valued storage.
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    /// Representable (min, max) for integer types; `None` for floats.
    pub fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            Self::Uint8 => Some((0.0, u8::MAX as f64)),
            Self::Int8 => Some((i8::MIN as f64, i8::MAX as f64)),
            Self::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Self::Uint16 => Some((0.0, u16::MAX as f64)),
            Self::Int32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Self::Uint32 => Some((0.0, u32::MAX as f64)),
            Self::Int64 => Some((i64::MIN as f64, i64::MAX as f64)),
            Self::Uint64 => Some((0.0, u64::MAX as f64)),
            Self::Float32 | Self::Float64 => None,
        }
    }
}

/// Opaque identity for a volume handle.
///
/// Buffers are mutated in place by the labeling and drawing tools, so object
/// identity matters; the id makes that identity explicit instead of leaning
/// on buffer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeId(u64);

static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

impl VolumeId {
    fn next() -> Self {
        Self(NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A 3D/4D voxel volume with resolved geometry.
///
/// The sample payload is immutable by convention; only derived transforms are
/// recomputed when orientation preferences change. Mutating tools (labeling,
/// drawing) write into their own buffers. At most one in-flight mutation per
/// buffer is assumed; callers on multithreaded hosts must serialize writers.
#[derive(Debug, Clone)]
pub struct VoxelVolume {
    pub id: VolumeId,
    /// Dimensions (nx, ny, nz, nt).
    pub dims: [usize; 4],
    /// Voxel spacing in mm (and seconds for the 4th axis).
    pub spacing: [f64; 4],
    /// Voxel-to-millimeter affine in native axis order.
    pub affine: Matrix4<f64>,
    /// Declared storage element type.
    pub element: ElementType,
    /// Set when no orientation source validated and an axis-aligned fallback
    /// was substituted. Consumed only for warnings downstream.
    pub untrustworthy: bool,
    /// Linear intensity rescale slope (sanitized, never 0 or NaN).
    pub scl_slope: f64,
    /// Linear intensity rescale intercept (sanitized, never NaN).
    pub scl_inter: f64,
    /// Flat sample buffer, length nx*ny*nz*nt.
    pub data: Vec<f64>,
}

impl VoxelVolume {
    /// Build a volume from an already-parsed NIfTI header and its samples.
    ///
    /// The header's orientation fields are resolved into a voxel-to-mm
    /// affine; if neither sform nor qform validates, an axis-aligned
    /// fallback is used and the volume is marked untrustworthy.
    ///
    /// # Arguments
    /// * `hdr` - Parsed NIfTI header (dims, spacings, orientation, rescale)
    /// * `data` - Flat sample buffer sized to the header dims
    /// * `prefer_qform` - Prefer the quaternion over the matrix when both validate
    pub fn from_header(hdr: &NiftiHeader, data: Vec<f64>, prefer_qform: bool) -> Result<Self> {
        let dims = [
            (hdr.dim[1].max(1)) as usize,
            (hdr.dim[2].max(1)) as usize,
            (hdr.dim[3].max(1)) as usize,
            if hdr.dim[0] >= 4 { (hdr.dim[4].max(1)) as usize } else { 1 },
        ];
        let expected = dims[0] * dims[1] * dims[2] * dims[3];
        if data.is_empty() {
            return Err(EngineError::EmptyVolume);
        }
        if data.len() != expected {
            return Err(EngineError::dimension_mismatch(expected, data.len()));
        }

        let resolved = affine::resolve_header(hdr, prefer_qform);
        let spacing = [
            affine::sanitize_spacing(hdr.pixdim[1] as f64),
            affine::sanitize_spacing(hdr.pixdim[2] as f64),
            affine::sanitize_spacing(hdr.pixdim[3] as f64),
            hdr.pixdim[4] as f64,
        ];

        // NaN or zero slope means "no scaling"; NaN intercept means 0.
        let slope = hdr.scl_slope as f64;
        let scl_slope = if slope.is_nan() || slope == 0.0 { 1.0 } else { slope };
        let inter = hdr.scl_inter as f64;
        let scl_inter = if inter.is_nan() { 0.0 } else { inter };

        Ok(Self {
            id: VolumeId::next(),
            dims,
            spacing,
            affine: resolved.affine,
            element: ElementType::from_nifti_code(hdr.datatype).unwrap_or(ElementType::Float64),
            untrustworthy: resolved.untrustworthy,
            scl_slope,
            scl_inter,
            data,
        })
    }

    /// Build a synthetic volume from explicit geometry (mainly for tools and
    /// tests); the affine is axis-aligned from the spacing.
    pub fn from_parts(
        dims: [usize; 3],
        spacing: [f64; 3],
        element: ElementType,
        data: Vec<f64>,
    ) -> Result<Self> {
        let expected = dims[0] * dims[1] * dims[2];
        if data.is_empty() {
            return Err(EngineError::EmptyVolume);
        }
        if data.len() != expected {
            return Err(EngineError::dimension_mismatch(expected, data.len()));
        }
        let sx = affine::sanitize_spacing(spacing[0]);
        let sy = affine::sanitize_spacing(spacing[1]);
        let sz = affine::sanitize_spacing(spacing[2]);
        #[rustfmt::skip]
        let affine = Matrix4::new(
            sx, 0.0, 0.0, 0.0,
            0.0, sy, 0.0, 0.0,
            0.0, 0.0, sz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        Ok(Self {
            id: VolumeId::next(),
            dims: [dims[0], dims[1], dims[2], 1],
            spacing: [sx, sy, sz, 0.0],
            affine,
            element,
            untrustworthy: false,
            scl_slope: 1.0,
            scl_inter: 0.0,
            data,
        })
    }

    /// Spatial dimensions (nx, ny, nz).
    pub fn dims3(&self) -> [usize; 3] {
        [self.dims[0], self.dims[1], self.dims[2]]
    }

    /// Spatial spacing in mm.
    pub fn spacing3(&self) -> [f64; 3] {
        [self.spacing[0], self.spacing[1], self.spacing[2]]
    }

    /// Number of samples in one 3D frame.
    pub fn nvox(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Linear index of voxel (i, j, k) in the first frame.
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims[0] + k * self.dims[0] * self.dims[1]
    }

    /// Convert a stored sample to its scaled intensity.
    pub fn raw_to_scaled(&self, raw: f64) -> f64 {
        raw * self.scl_slope + self.scl_inter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_codes_roundtrip() {
        for code in [2i16, 4, 8, 16, 64, 256, 512, 768, 1024, 1280] {
            let et = ElementType::from_nifti_code(code).unwrap();
            assert_eq!(et.nifti_code(), code);
        }
        assert!(ElementType::from_nifti_code(128).is_none(), "RGB24 unsupported");
    }

    #[test]
    fn test_integer_ranges() {
        assert_eq!(ElementType::Uint8.integer_range(), Some((0.0, 255.0)));
        assert_eq!(ElementType::Int16.integer_range(), Some((-32768.0, 32767.0)));
        assert!(ElementType::Float32.integer_range().is_none());
        assert!(ElementType::Uint8.is_integer());
        assert!(!ElementType::Float64.is_integer());
    }

    #[test]
    fn test_from_parts_indexing() {
        let vol = VoxelVolume::from_parts(
            [4, 3, 2],
            [1.0, 2.0, 3.0],
            ElementType::Float32,
            vec![0.0; 24],
        )
        .unwrap();
        assert_eq!(vol.nvox(), 24);
        assert_eq!(vol.index(1, 1, 1), 1 + 4 + 12);
        assert_eq!(vol.affine[(2, 2)], 3.0);
    }

    #[test]
    fn test_from_parts_rejects_bad_length() {
        let err = VoxelVolume::from_parts([4, 4, 4], [1.0; 3], ElementType::Uint8, vec![0.0; 10]);
        assert!(matches!(
            err,
            Err(EngineError::DimensionMismatch { expected: 64, actual: 10 })
        ));
    }

    #[test]
    fn test_from_header_sanitizes_rescale() {
        let mut hdr = NiftiHeader::default();
        hdr.dim = [3, 2, 2, 2, 1, 1, 1, 1];
        hdr.pixdim = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        hdr.scl_slope = 0.0;
        hdr.scl_inter = f32::NAN;
        let vol = VoxelVolume::from_header(&hdr, vec![0.0; 8], false).unwrap();
        assert_eq!(vol.scl_slope, 1.0);
        assert_eq!(vol.scl_inter, 0.0);
        assert_eq!(vol.raw_to_scaled(5.0), 5.0);
    }

    #[test]
    fn test_volume_ids_unique() {
        let a = VoxelVolume::from_parts([2, 2, 1], [1.0; 3], ElementType::Uint8, vec![0.0; 4])
            .unwrap();
        let b = VoxelVolume::from_parts([2, 2, 1], [1.0; 3], ElementType::Uint8, vec![0.0; 4])
            .unwrap();
        assert_ne!(a.id, b.id);
    }
}
