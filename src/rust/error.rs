//! Error types for engine loading and inference.

use std::path::PathBuf;

use thiserror::Error;

/// Every failure surfaced by the wrapper or a runtime backend.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine file does not exist
    #[error("engine file not found: {0}")]
    NotFound(PathBuf),

    /// The engine file exists but could not be read
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The runtime rejected the engine blob
    #[error("failed to deserialize engine: {0}")]
    Deserialization(String),

    /// The engine does not expose one input at binding 0 and one output at binding 1
    #[error("unsupported binding layout: {0}")]
    BindingLayout(String),

    /// A sample or batch does not match the input binding
    #[error("input mismatch: expected {expected}, got {actual}")]
    InputMismatch { expected: String, actual: String },

    /// A call-level precondition was violated before any device work
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Fault reported by the driver or the inference runtime
    #[error("{backend} runtime fault in {op}: {message}")]
    Runtime {
        backend: &'static str,
        op: &'static str,
        message: String,
    },

    /// Invalid runner configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn runtime(backend: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        EngineError::Runtime {
            backend,
            op,
            message: message.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        EngineError::InputMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_fault_names_backend_and_op() {
        let err = EngineError::runtime("tensorrt", "cudaMemcpyAsync", "invalid argument");
        assert_eq!(
            err.to_string(),
            "tensorrt runtime fault in cudaMemcpyAsync: invalid argument"
        );
    }

    #[test]
    fn mismatch_formats_both_sides() {
        let err = EngineError::mismatch("half[3x32x32]", "half[3x16x16]");
        assert!(err.to_string().contains("expected half[3x32x32]"));
        assert!(err.to_string().contains("got half[3x16x16]"));
    }
}
