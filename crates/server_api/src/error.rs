use shared::error::{ApiError, ErrorCode};
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Authentication(_) => ErrorCode::Authentication,
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Forbidden(_) => ErrorCode::Forbidden,
            CoreError::Storage(_) => ErrorCode::Storage,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        let message = match &value {
            CoreError::Authentication(reason)
            | CoreError::Validation(reason)
            | CoreError::NotFound(reason)
            | CoreError::Forbidden(reason) => reason.clone(),
            // store details stay in the server log
            CoreError::Storage(_) => "storage unavailable".to_string(),
        };
        ApiError::new(value.code(), message)
    }
}
