use crate::device::DeviceId;
use crate::dtype::DType;

/// Coarse classification of a [`TensorError`], used by callers that only care
/// about which family of precondition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Reshape ambiguity, volume mismatch, incompatible shapes.
    Shape,
    /// Unsupported or incompatible dtype/layout combination.
    Type,
    /// The tensor does not have the storage kind an operation needs, or the
    /// requested device/index is not part of its distribution.
    Storage,
    /// The device worker backing a buffer is no longer running.
    Device,
}

/// Errors surfaced by tensor storage and layout operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("cannot reshape into {requested:?}: {reason}")]
    InvalidReshape { requested: Vec<i64>, reason: String },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("shape error: {0}")]
    ShapeError(String),

    #[error("unsupported data type {0}")]
    UnsupportedDType(DType),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("device {device} is unavailable: {reason}")]
    DeviceUnavailable { device: DeviceId, reason: String },
}

impl TensorError {
    /// The error family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TensorError::InvalidReshape { .. }
            | TensorError::ShapeMismatch { .. }
            | TensorError::ShapeError(_) => ErrorKind::Shape,
            TensorError::UnsupportedDType(_) | TensorError::TypeError(_) => ErrorKind::Type,
            TensorError::StorageError(_) => ErrorKind::Storage,
            TensorError::DeviceUnavailable { .. } => ErrorKind::Device,
        }
    }
}
