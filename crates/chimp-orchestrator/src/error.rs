// Error types for orchestration

use chimp_training::{PluginExecutionError, TrainingError};
use thiserror::Error;

use crate::lifecycle::ModelStage;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// No plugin is registered under the requested name
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// A plugin with the same name is already registered
    #[error("plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    /// The plugin describes itself with a malformed descriptor
    #[error("plugin '{plugin}' has an invalid descriptor: {reason}")]
    InvalidDescriptor {
        /// Plugin name (may be blank)
        plugin: String,
        /// What is wrong with the descriptor
        reason: String,
    },

    /// A submission is missing a declared, non-optional argument or dataset
    #[error("invalid submission for plugin '{plugin}': {reason}")]
    InvalidSubmission {
        /// Plugin name
        plugin: String,
        /// What is missing
        reason: String,
    },

    /// No run exists with the given id
    #[error("unknown run '{0}'")]
    UnknownRun(String),

    /// The plugin body failed; terminal for the run
    #[error(transparent)]
    PluginExecution(#[from] PluginExecutionError),

    /// Transient infrastructure failure of a backing store or the queue
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The artifact store has no object under the key
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// The requested model version does not exist
    #[error("model version not found: {experiment}/{model} v{version}")]
    ModelNotFound {
        /// Experiment name
        experiment: String,
        /// Model name
        model: String,
        /// Requested version
        version: u32,
    },

    /// The requested stage change is not allowed from the current stage
    #[error("cannot move model version from {from} to {to}")]
    InvalidStageTransition {
        /// Current stage
        from: ModelStage,
        /// Requested stage
        to: ModelStage,
    },

    /// A calibration label is outside the configured category set
    #[error("invalid label '{label}' (expected one of: {})", expected.join(", "))]
    InvalidLabel {
        /// Offending label
        label: String,
        /// Accepted labels
        expected: Vec<String>,
    },

    /// A calibration sample reuses a timestamp already buffered in the session
    #[error("session '{session}' already holds a sample at {timestamp}")]
    DuplicateSample {
        /// Session id
        session: String,
        /// Duplicated timestamp
        timestamp: String,
    },

    /// A calibration sample cannot be accepted into its session
    #[error("invalid sample for session '{session}': {reason}")]
    InvalidSample {
        /// Session id
        session: String,
        /// Why the sample was rejected
        reason: String,
    },

    /// Flush requested on a session with no buffered samples
    #[error("calibration session '{0}' has no samples")]
    EmptySession(String),

    /// Training contract or archive error
    #[error(transparent)]
    Training(TrainingError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestrationError {
    /// Whether the failure is transient and the operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Io(_))
    }

    /// Builds a [`OrchestrationError::StoreUnavailable`] from any displayable cause.
    pub fn store(cause: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(cause.to_string())
    }
}

impl From<TrainingError> for OrchestrationError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::InvalidLabel { label, expected } => {
                Self::InvalidLabel { label, expected }
            }
            TrainingError::InvalidDescriptor(reason) => {
                Self::InvalidDescriptor { plugin: String::new(), reason }
            }
            TrainingError::Io(err) => Self::Io(err),
            other => Self::Training(other),
        }
    }
}
