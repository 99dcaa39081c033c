//! Error types for Convoy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("unsupported git source: {0}")]
    UnsupportedSource(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("secret codec: {0}")]
    Codec(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
