//! Training run records.

use crate::lifecycle::RunStatus;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One invocation of a plugin, as persisted in the run store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub plugin_name: String,
    pub submitted_args: BTreeMap<String, String>,
    /// Dataset name to artifact-store key prefix.
    pub dataset_refs: BTreeMap<String, String>,
    pub status: RunStatus,
    pub result_model_uri: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub hyperparameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub experiment_name: Option<String>,
    pub model_version: Option<u32>,
    /// Number of claims so far, including reclaims after a lost lease.
    pub attempts: u32,
    /// Current (or last) claim holder.
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Failure cause for failed runs, or the last transient cause for retried ones.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingRun {
    /// Creates a queued run with a fresh v4 id.
    #[must_use]
    pub fn new(
        plugin_name: impl Into<String>,
        submitted_args: BTreeMap<String, String>,
        dataset_refs: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            plugin_name: plugin_name.into(),
            submitted_args,
            dataset_refs,
            status: RunStatus::Queued,
            result_model_uri: None,
            metrics: BTreeMap::new(),
            hyperparameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            experiment_name: None,
            model_version: None,
            attempts: 0,
            worker_id: None,
            lease_expires_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a running run's lease has lapsed at `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|expires| expires <= now)
    }

    /// Applies a claim by `worker_id` in place.
    pub fn mark_claimed(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.attempts += 1;
        self.lease_expires_at = Some(lease_deadline(now, lease));
        self.updated_at = now;
    }

    /// Copies a successful outcome onto the run and marks it succeeded.
    pub fn mark_succeeded(&mut self, completion: &RunCompletion, now: DateTime<Utc>) {
        self.status = RunStatus::Succeeded;
        self.result_model_uri.clone_from(&completion.result_model_uri);
        self.metrics.clone_from(&completion.metrics);
        self.hyperparameters.clone_from(&completion.hyperparameters);
        self.tags.clone_from(&completion.tags);
        self.experiment_name.clone_from(&completion.experiment_name);
        self.model_version = completion.model_version;
        self.lease_expires_at = None;
        self.error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, cause: &str, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.lease_expires_at = None;
        self.error = Some(cause.to_string());
        self.updated_at = now;
    }

    /// Puts a running run back in the queue after a transient failure.
    pub fn mark_requeued(&mut self, cause: &str, now: DateTime<Utc>) {
        self.status = RunStatus::Queued;
        self.lease_expires_at = None;
        self.error = Some(cause.to_string());
        self.updated_at = now;
    }

    /// Whether `worker_id` currently holds this run.
    #[must_use]
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == RunStatus::Running && self.worker_id.as_deref() == Some(worker_id)
    }
}

/// Results written to a run when it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub result_model_uri: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub hyperparameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub experiment_name: Option<String>,
    pub model_version: Option<u32>,
}

/// Result of a compare-and-set claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the run.
    Claimed(TrainingRun),
    /// Another worker holds a live lease on the run.
    HeldByOther {
        worker_id: String,
        lease_expires_at: Option<DateTime<Utc>>,
    },
    /// The run already reached a terminal status.
    Finished(RunStatus),
    /// No run with that id exists.
    NotFound,
}

/// Adds a std duration to a timestamp, saturating on overflow.
#[must_use]
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = ChronoDuration::from_std(lease).unwrap_or(ChronoDuration::MAX);
    now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decides a claim against the current state of a run.
///
/// Shared by every [`RunStore`](crate::store::RunStore) so the compare-and-set
/// rules stay identical across backends. Mutates `run` only when the claim
/// succeeds.
pub fn try_claim(
    run: &mut TrainingRun,
    worker_id: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> ClaimOutcome {
    match run.status {
        RunStatus::Queued => {
            run.mark_claimed(worker_id, lease, now);
            ClaimOutcome::Claimed(run.clone())
        }
        RunStatus::Running if run.lease_expired(now) => {
            run.mark_claimed(worker_id, lease, now);
            ClaimOutcome::Claimed(run.clone())
        }
        RunStatus::Running => ClaimOutcome::HeldByOther {
            worker_id: run.worker_id.clone().unwrap_or_default(),
            lease_expires_at: run.lease_expires_at,
        },
        status => ClaimOutcome::Finished(status),
    }
}
