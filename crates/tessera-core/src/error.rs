//! Error types for program building and execution

use tessera_backends::BackendError;
use tessera_ir::IrError;

/// Result type for tessera-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure affects the program that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The program is cleared and must be rebuilt.
    Fatal,
    /// The call was rejected; the program stays usable.
    Request,
}

/// Errors that can occur while building or executing a program
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller shape does not satisfy the declared type
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Operation recognised but not executable here
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Caller buffer smaller than the data it must hold
    #[error("argument too small: {required} bytes required, {actual} provided")]
    ArgumentTooSmall { required: usize, actual: usize },

    /// Missing, duplicated or out-of-range argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cache buffer cannot be decoded
    #[error("corrupt program cache: {0}")]
    CorruptCache(String),

    /// Backend tag outside the known set
    #[error("unsupported backend tag {0}")]
    UnsupportedBackend(i32),

    /// Graph cannot be split into sub-models
    #[error("partitioning failed: {0}")]
    Partition(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Execute called before a successful build
    #[error("program is not built")]
    NotBuilt,

    #[error(transparent)]
    Backend(BackendError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache file encoding failed: {0}")]
    Serialization(#[from] bincode::Error),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidDimensions(_)
            | Error::FeatureNotSupported(_)
            | Error::ArgumentTooSmall { .. }
            | Error::InvalidArgument(_) => ErrorCategory::Request,
            _ => ErrorCategory::Fatal,
        }
    }

    /// Create an invalid dimensions error
    pub fn invalid_dimensions(msg: impl Into<String>) -> Self {
        Self::InvalidDimensions(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a corrupt cache error
    pub fn corrupt_cache(msg: impl Into<String>) -> Self {
        Self::CorruptCache(msg.into())
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::FeatureNotSupported(msg) => Error::FeatureNotSupported(msg),
            BackendError::Ir(err) => Error::Ir(err),
            other => Error::Backend(other),
        }
    }
}
