//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A caller-supplied value is malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current state.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A device, handle or executable does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend initialization failed.
    #[error("Backend initialization failed: {0}")]
    InitError(String),

    /// Buffer allocation failed.
    #[error("Buffer allocation failed: {0}")]
    AllocationError(String),

    /// Program compilation failed.
    #[error("Compilation failed: {0}")]
    CompileError(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderError(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Host/device transfer failed.
    #[error("Transfer failed: {0}")]
    TransferError(String),

    /// Shape, literal or program error from `spindle-core`.
    #[error(transparent)]
    Core(#[from] spindle_core::Error),

    /// Buffer async error.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    /// Compile, execute, transfer, allocation or init failure in a backend.
    Backend,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidArgument(_) | RuntimeError::Core(_) => ErrorKind::InvalidArgument,
            RuntimeError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::InitError(_)
            | RuntimeError::AllocationError(_)
            | RuntimeError::CompileError(_)
            | RuntimeError::ShaderError(_)
            | RuntimeError::ExecutionError(_)
            | RuntimeError::TransferError(_)
            | RuntimeError::BufferAsyncError(_) => ErrorKind::Backend,
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            RuntimeError::FailedPrecondition("x".into()).kind(),
            ErrorKind::FailedPrecondition
        );
        assert_eq!(RuntimeError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(RuntimeError::CompileError("x".into()).kind(), ErrorKind::Backend);
        let core: RuntimeError = spindle_core::Error::Shape("bad".into()).into();
        assert_eq!(core.kind(), ErrorKind::InvalidArgument);
        assert_eq!(core.to_string(), spindle_core::Error::Shape("bad".into()).to_string());
    }
}
