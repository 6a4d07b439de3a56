//! Error types for the storage layer.

use chimp_orchestrator::OrchestrationError;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Item not found in storage.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data error.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The orchestrator treats every storage failure as the backend being
/// unavailable, which makes it retryable.
impl From<StorageError> for OrchestrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(err) => Self::Io(err),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}
