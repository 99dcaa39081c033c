//! Executor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("registry lookup failed: {0}")]
    Registry(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] convoy_core::Error),
}

pub type ExecResult<T> = std::result::Result<T, ExecutorError>;

impl ExecutorError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ExecutorError::NotFound { .. } => true,
            ExecutorError::Kube(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        ExecutorError::Registry(err.to_string())
    }
}

impl From<ExecutorError> for convoy_core::Error {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Core(inner) => inner,
            ExecutorError::NotFound { kind, name } => {
                convoy_core::Error::NotFound(format!("{kind} {name}"))
            }
            ExecutorError::Timeout(what) => convoy_core::Error::Timeout(what),
            other => convoy_core::Error::ExecutionFailed(other.to_string()),
        }
    }
}
