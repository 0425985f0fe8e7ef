//! Error types for devices, kernels and the accelerator runtime

use std::fmt;

use tessera_ir::{IrError, OperationType};

use crate::kernel::KernelTarget;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while moving data or running kernels and plans
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Type mismatch
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Operand shapes cannot be combined
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor has no storage yet
    #[error("tensor is not allocated")]
    Unallocated,

    /// No kernel registered for an operation
    #[error("no {target} kernel registered for {op_type}")]
    KernelNotRegistered {
        target: KernelTarget,
        op_type: OperationType,
    },

    /// Operation recognised but deliberately not executable
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Device-level failure
    #[error("device error: {0}")]
    Device(String),

    /// Execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Builder configuration rejected
    #[error("invalid accelerator configuration: {0}")]
    InvalidConfig(String),

    /// Plan bytes are malformed or from an incompatible builder
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Engine binding missing, unallocated or misshaped
    #[error("binding error: {0}")]
    Binding(String),

    /// Calibration data could not be read or produced
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Graph-level error
    #[error(transparent)]
    Ir(#[from] IrError),

    /// Plan encoding failure
    #[error("plan serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// Calibration file access
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an execution error
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Create a binding error
    pub fn binding(msg: impl Into<String>) -> Self {
        Self::Binding(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
