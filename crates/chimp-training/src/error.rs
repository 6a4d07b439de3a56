use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid calibration label '{label}' (expected one of: {})", expected.join(", "))]
    InvalidLabel { label: String, expected: Vec<String> },

    #[error("calibration archive error: {0}")]
    Archive(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure raised by a plugin body.
///
/// Terminal for the run that produced it: the dispatcher records `cause` on the
/// run and never retries automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plugin execution failed: {cause}")]
pub struct PluginExecutionError {
    pub cause: String,
}

impl PluginExecutionError {
    pub fn new(cause: impl Into<String>) -> Self {
        Self { cause: cause.into() }
    }
}

impl From<TrainingError> for PluginExecutionError {
    fn from(err: TrainingError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for PluginExecutionError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for PluginExecutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("json error: {err}"))
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginExecutionError>;
