//! Storage seams of the orchestrator.
//!
//! The dispatcher, promotion workflow and calibration coordinator talk to the
//! outside world only through the traits in this module. `chimp-core` provides
//! SQLite and filesystem implementations; [`memory`] provides in-process ones
//! used by tests and single-process deployments.

pub mod memory;

use crate::error::Result;
use crate::lifecycle::{ModelStage, RunStatus};
use crate::run::{ClaimOutcome, RunCompletion, TrainingRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{
    FaultPlan, InMemoryArtifactStore, InMemoryExperimentRegistry, InMemoryRunStore,
    InMemoryWorkQueue,
};

/// The four backends the orchestrator is wired to.
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub experiments: Arc<dyn ExperimentRegistry>,
}

impl Stores {
    /// Fresh in-memory backends.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            runs: Arc::new(InMemoryRunStore::new()),
            queue: Arc::new(InMemoryWorkQueue::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            experiments: Arc::new(InMemoryExperimentRegistry::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Durable record of training runs.
///
/// Every status change is a compare-and-set: mutations take the id of the
/// worker expected to hold the run and return `false` (without writing) when
/// it no longer does.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a new run. Fails if the id already exists.
    async fn insert(&self, run: &TrainingRun) -> Result<()>;

    async fn get(&self, run_id: &str) -> Result<Option<TrainingRun>>;

    /// Most recent first, optionally filtered by status.
    async fn list(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<TrainingRun>>;

    /// Atomically claims a queued run, or reclaims a running run whose lease lapsed.
    async fn claim(&self, run_id: &str, worker_id: &str, lease: Duration) -> Result<ClaimOutcome>;

    /// Extends the lease of a run still held by `worker_id`.
    async fn renew_lease(&self, run_id: &str, worker_id: &str, lease: Duration) -> Result<bool>;

    async fn complete(&self, run_id: &str, worker_id: &str, completion: &RunCompletion)
    -> Result<bool>;

    async fn fail(&self, run_id: &str, worker_id: &str, cause: &str) -> Result<bool>;

    /// `running -> queued` after a transient failure; the cause is kept on the run.
    async fn requeue(&self, run_id: &str, worker_id: &str, cause: &str) -> Result<bool>;

    /// Deletes a run that never left the queue. Used to roll back a submission
    /// whose enqueue failed.
    async fn withdraw(&self, run_id: &str) -> Result<bool>;
}

/// A leased queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub run_id: String,
    /// How many times this entry has been handed out, including this one.
    pub deliveries: u32,
}

/// Pending/leased entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub leased: usize,
}

/// At-least-once queue of run ids.
///
/// A dequeued entry stays invisible for the lease and becomes deliverable
/// again if it is neither acked nor extended in time.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Makes `run_id` deliverable after `delay`.
    async fn enqueue(&self, run_id: &str, delay: Duration) -> Result<()>;

    async fn dequeue(&self, worker_id: &str, lease: Duration) -> Result<Option<Delivery>>;

    /// Removes the entry for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Releases the lease; the entry is redelivered after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    async fn extend(&self, delivery: &Delivery, lease: Duration) -> Result<()>;

    async fn depth(&self) -> Result<QueueDepth>;
}

/// Blob store for datasets and model binaries.
///
/// Missing keys surface as `ArtifactNotFound`, transport problems as
/// `StoreUnavailable`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores `bytes` under `key`, replacing any previous object, and returns its URI.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// URI the store would report for `key`.
    fn uri(&self, key: &str) -> String;
}

/// Metrics and parameters logged for one run under an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub run_id: String,
    pub experiment_name: String,
    pub plugin_name: String,
    pub metrics: BTreeMap<String, f64>,
    pub hyperparameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// A registered model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub experiment_name: String,
    pub model_name: String,
    pub version: u32,
    pub stage: ModelStage,
    pub artifact_uri: String,
    pub run_id: String,
    pub hyperparameters: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`ExperimentRegistry::create_model_version`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewModelVersion {
    pub experiment_name: String,
    pub model_name: String,
    pub artifact_uri: String,
    pub run_id: String,
    pub hyperparameters: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
}

/// Outcome of a stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    pub previous_stage: ModelStage,
    pub version: ModelVersion,
    /// Former production holder moved to staging by this change.
    pub demoted: Option<ModelVersion>,
}

/// Experiment tracking and model lifecycle.
#[async_trait]
pub trait ExperimentRegistry: Send + Sync {
    /// Records (or overwrites) the run's entry under its experiment.
    async fn record_run(&self, run: &ExperimentRun) -> Result<()>;

    async fn list_runs(&self, experiment_name: &str) -> Result<Vec<ExperimentRun>>;

    /// Registers the next version in stage `none`.
    ///
    /// Idempotent per `run_id`: a retried run gets back the version it
    /// registered the first time.
    async fn create_model_version(&self, new: NewModelVersion) -> Result<ModelVersion>;

    async fn get_version(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
    ) -> Result<Option<ModelVersion>>;

    /// Ascending by version.
    async fn list_versions(&self, experiment_name: &str, model_name: &str)
    -> Result<Vec<ModelVersion>>;

    /// Highest version currently in `stage`.
    async fn latest_in_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<ModelVersion>>;

    /// Atomically moves `version` from `expected` to `target`.
    ///
    /// Fails with `ModelNotFound` if the version does not exist and with
    /// `InvalidStageTransition` if its stage is no longer `expected` or the move
    /// is not allowed. Moving to production demotes the previous holder to
    /// staging in the same transaction.
    async fn transition_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
        expected: ModelStage,
        target: ModelStage,
    ) -> Result<StageChange>;

    async fn production_version(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> Result<Option<ModelVersion>> {
        self.latest_in_stage(experiment_name, model_name, ModelStage::Production).await
    }
}
