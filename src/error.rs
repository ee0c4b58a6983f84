//! Error types for volume geometry and segmentation operations.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during volume operations.
///
/// Recoverable conditions (malformed orientation, degenerate spacing,
/// out-of-bounds seeds) are handled locally and never surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A supplied buffer's length does not match the volume extent.
    #[error("buffer length {actual} does not match volume extent {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Volume has no samples.
    #[error("volume has no samples")]
    EmptyVolume,
}

impl EngineError {
    /// Create a dimension mismatch error.
    #[must_use]
    pub const fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }
}
