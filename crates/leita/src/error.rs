//! Common error types for leita.

use thiserror::Error;

/// Errors reported at the decoding API boundary.
///
/// Shape and parameter problems are detected eagerly, at construction and at
/// `set_logits` entry. The core never retries; a failed call leaves the
/// search handle in a defined-but-unspecified state and the driver is
/// expected to discard it.
#[derive(Debug, Error)]
pub enum LeitaError {
    /// A buffer does not have the size the current search shape requires.
    #[error("shape mismatch in {context}: {details}")]
    ShapeMismatch {
        context: &'static str,
        details: String,
    },

    /// Search parameters are inconsistent or out of range.
    #[error("invalid search parameters: {0}")]
    InvalidParams(String),

    /// A non-finite value reached a place that requires finite scores.
    #[error("numeric fault: {0}")]
    NumericFault(String),

    /// Host or device allocation was refused.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// A synchronous host<->device copy did not complete.
    #[error("device transfer failed: {0}")]
    DeviceTransfer(String),

    /// Device memory was requested but no wgpu adapter is available.
    #[error("gpu requested but no wgpu adapter is available")]
    GpuUnavailable,
}

/// Result type for leita operations.
pub type LeitaResult<T> = Result<T, LeitaError>;
