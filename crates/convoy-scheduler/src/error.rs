//! Service error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] convoy_core::Error),

    #[error(transparent)]
    Db(#[from] convoy_db::DbError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ServiceError::Core(convoy_core::Error::NotFound(_)) | ServiceError::Db(convoy_db::DbError::NotFound(_))
        )
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
