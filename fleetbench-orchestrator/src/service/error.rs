//! Engine Errors

use crate::repository::StoreError;
use crate::storage::StorageError;

/// Service error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateExternalId(id) => {
                EngineError::Validation(format!("Run ID '{id}' is already taken"))
            }
            other => EngineError::Store(other),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
