//! Error taxonomy for the dispatch layer.
//!
//! Every variant is terminal for the dispatch call that produced it; nothing
//! in this crate retries.

use std::path::PathBuf;

use thiserror::Error;

use crate::dtype::ScalarType;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported {param}: {value}, only support {allowed}")]
    InvalidArgument {
        param: &'static str,
        value: String,
        allowed: &'static str,
    },
    #[error("dtype {0:?} has no filename-safe code")]
    UnsupportedDtype(ScalarType),
    #[error("tensor `{0}` is not defined")]
    UndefinedTensor(&'static str),
    #[error("shape mismatch for `{name}`: expected {expected}, got {got}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        got: String,
    },
    #[error("kernel module `{uri}` not found at {}", path.display())]
    ModuleNotFound { uri: String, path: PathBuf },
    #[error("failed to load kernel module `{uri}` from {}: {reason}", path.display())]
    ModuleLoad {
        uri: String,
        path: PathBuf,
        reason: String,
    },
    #[error("kernel module `{uri}` ({}) does not export `{function}`", path.display())]
    MissingEntryPoint {
        uri: String,
        function: String,
        path: PathBuf,
    },
    #[error("kernel `{uri}::{function}` failed: {message}")]
    KernelCall {
        uri: String,
        function: String,
        message: String,
    },
    #[error("invalid dispatch config: {0}")]
    Config(String),
    #[error("cuda driver error: {0}")]
    Cuda(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub(crate) fn shape(name: &'static str, expected: impl Into<String>, got: &[i64]) -> Self {
        DispatchError::ShapeMismatch {
            name,
            expected: expected.into(),
            got: format!("{got:?}"),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Config(err.to_string())
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for DispatchError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        DispatchError::Cuda(format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_names_value_and_allowed_set() {
        let err = DispatchError::InvalidArgument {
            param: "act mode",
            value: "relu".to_string(),
            allowed: "silu, gelu, gelu_tanh",
        };
        assert_eq!(
            err.to_string(),
            "unsupported act mode: relu, only support silu, gelu, gelu_tanh"
        );
    }

    #[test]
    fn module_not_found_includes_path() {
        let err = DispatchError::ModuleNotFound {
            uri: "norm".to_string(),
            path: PathBuf::from("/tmp/cache/norm/norm.so"),
        };
        let msg = err.to_string();
        assert!(msg.contains("`norm`"));
        assert!(msg.contains("/tmp/cache/norm/norm.so"));
    }
}
