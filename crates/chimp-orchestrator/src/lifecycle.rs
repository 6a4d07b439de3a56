//! Run and model-version lifecycles.
//!
//! Both are small state machines. [`RunStatus`] is owned by the dispatcher and
//! only ever moves forward (apart from a retry putting a running run back in
//! the queue); [`ModelStage`] is owned by the experiment registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution status of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Persisted and waiting for a worker.
    Queued,
    /// Claimed by exactly one worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a recorded cause.
    Failed,
}

impl RunStatus {
    /// Checks if a run in this status can move to `to`.
    ///
    /// `Running -> Queued` is the retry path; `Running -> Running` is a lease
    /// reclaim by another worker.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Queued, Self::Running) => true,
            (Self::Running, Self::Running | Self::Queued | Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }

    /// Terminal runs are immutable.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Promotion stage of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    /// Registered but not promoted.
    #[default]
    None,
    /// Candidate for production.
    Staging,
    /// The version serving should use. At most one per experiment/model pair.
    Production,
}

impl ModelStage {
    /// Checks if a version in this stage can be moved to `to`.
    ///
    /// Staying in the same stage is allowed and is a no-op. A version must pass
    /// through staging before production; production may be rolled back to
    /// staging or straight to none.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::None, Self::None | Self::Staging) => true,
            (Self::Staging, _) => true,
            (Self::Production, _) => true,
            (Self::None, Self::Production) => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(format!("unknown model stage '{other}'")),
        }
    }
}
