//! Error types for CHIMP Core.

use crate::storage::StorageError;
use chimp_orchestrator::OrchestrationError;
use thiserror::Error;

/// Core error type for CHIMP service operations.
#[derive(Error, Debug)]
pub enum ChimpError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Orchestration errors
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    /// Server-related errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for CHIMP service operations.
pub type Result<T> = std::result::Result<T, ChimpError>;
