use crate::domain::reconciler::ReconcileError;
use crate::domain::tracker::TransitionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<ReconcileError> for InfraError {
    fn from(error: ReconcileError) -> Self {
        match error {
            ReconcileError::ActivityNotFound(_) => Self::NotFound(error.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<TransitionError> for InfraError {
    fn from(error: TransitionError) -> Self {
        match error {
            TransitionError::Validation(message) => Self::Validation(message),
            other => Self::Precondition(other.to_string()),
        }
    }
}
