//! In-process store implementations.
//!
//! Each store keeps its state behind a single mutex, so every compare-and-set
//! happens inside one critical section. A [`FaultPlan`] lets tests make the
//! next N calls of an operation fail with `StoreUnavailable`.

use super::{
    ArtifactStore, Delivery, ExperimentRegistry, ExperimentRun, ModelVersion, NewModelVersion,
    QueueDepth, RunStore, StageChange, WorkQueue,
};
use crate::error::{OrchestrationError, Result};
use crate::lifecycle::{ModelStage, RunStatus};
use crate::run::{lease_deadline, try_claim, ClaimOutcome, RunCompletion, TrainingRun};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Injected failures, keyed by operation name (`"get"`, `"put"`, `"claim"`, ...).
#[derive(Debug, Default)]
pub struct FaultPlan {
    remaining: Mutex<HashMap<&'static str, u32>>,
}

impl FaultPlan {
    /// Makes the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        lock(&self.remaining).insert(op, times);
    }

    /// Consumes one injected failure for `op`, if any.
    pub fn check(&self, op: &'static str) -> Result<()> {
        let mut remaining = lock(&self.remaining);
        match remaining.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                debug!(op, left = *n, "Injected store failure");
                Err(OrchestrationError::StoreUnavailable(format!("injected failure in {op}")))
            }
            _ => Ok(()),
        }
    }
}

/// Run store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, TrainingRun>>,
    faults: FaultPlan,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Applies `update` only if `worker_id` still holds the run.
    fn update_held(
        &self,
        run_id: &str,
        worker_id: &str,
        update: impl FnOnce(&mut TrainingRun),
    ) -> bool {
        let mut runs = lock(&self.runs);
        match runs.get_mut(run_id) {
            Some(run) if run.is_held_by(worker_id) => {
                update(run);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &TrainingRun) -> Result<()> {
        self.faults.check("insert")?;
        let mut runs = lock(&self.runs);
        if runs.contains_key(&run.run_id) {
            return Err(OrchestrationError::StoreUnavailable(format!(
                "run '{}' already exists",
                run.run_id
            )));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<TrainingRun>> {
        self.faults.check("get")?;
        Ok(lock(&self.runs).get(run_id).cloned())
    }

    async fn list(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<TrainingRun>> {
        self.faults.check("list")?;
        let mut runs: Vec<TrainingRun> = lock(&self.runs)
            .values()
            .filter(|run| status.is_none_or(|s| run.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn claim(&self, run_id: &str, worker_id: &str, lease: Duration) -> Result<ClaimOutcome> {
        self.faults.check("claim")?;
        let mut runs = lock(&self.runs);
        Ok(match runs.get_mut(run_id) {
            Some(run) => try_claim(run, worker_id, lease, Utc::now()),
            None => ClaimOutcome::NotFound,
        })
    }

    async fn renew_lease(&self, run_id: &str, worker_id: &str, lease: Duration) -> Result<bool> {
        self.faults.check("renew_lease")?;
        let now = Utc::now();
        Ok(self.update_held(run_id, worker_id, |run| {
            run.lease_expires_at = Some(lease_deadline(now, lease));
            run.updated_at = now;
        }))
    }

    async fn complete(
        &self,
        run_id: &str,
        worker_id: &str,
        completion: &RunCompletion,
    ) -> Result<bool> {
        self.faults.check("complete")?;
        Ok(self.update_held(run_id, worker_id, |run| run.mark_succeeded(completion, Utc::now())))
    }

    async fn fail(&self, run_id: &str, worker_id: &str, cause: &str) -> Result<bool> {
        self.faults.check("fail")?;
        Ok(self.update_held(run_id, worker_id, |run| run.mark_failed(cause, Utc::now())))
    }

    async fn requeue(&self, run_id: &str, worker_id: &str, cause: &str) -> Result<bool> {
        self.faults.check("requeue")?;
        Ok(self.update_held(run_id, worker_id, |run| run.mark_requeued(cause, Utc::now())))
    }

    async fn withdraw(&self, run_id: &str) -> Result<bool> {
        let mut runs = lock(&self.runs);
        if runs.get(run_id).is_some_and(|run| run.status == RunStatus::Queued) {
            runs.remove(run_id);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Debug)]
struct QueueEntry {
    run_id: String,
    available_at: Instant,
    leased_by: Option<String>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    entries: BTreeMap<u64, QueueEntry>,
}

/// FIFO work queue with visibility leases.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    faults: FaultPlan,
}

impl InMemoryWorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, run_id: &str, delay: Duration) -> Result<()> {
        self.faults.check("enqueue")?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.entries.insert(
            id,
            QueueEntry {
                run_id: run_id.to_string(),
                available_at: Instant::now() + delay,
                leased_by: None,
                deliveries: 0,
            },
        );
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str, lease: Duration) -> Result<Option<Delivery>> {
        self.faults.check("dequeue")?;
        let now = Instant::now();
        let mut state = lock(&self.state);
        let Some((&id, entry)) =
            state.entries.iter_mut().find(|(_, entry)| entry.available_at <= now)
        else {
            return Ok(None);
        };
        entry.available_at = now + lease;
        entry.leased_by = Some(worker_id.to_string());
        entry.deliveries += 1;
        Ok(Some(Delivery {
            delivery_id: id,
            run_id: entry.run_id.clone(),
            deliveries: entry.deliveries,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.faults.check("ack")?;
        lock(&self.state).entries.remove(&delivery.delivery_id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.faults.check("nack")?;
        if let Some(entry) = lock(&self.state).entries.get_mut(&delivery.delivery_id) {
            entry.available_at = Instant::now() + delay;
            entry.leased_by = None;
        }
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, lease: Duration) -> Result<()> {
        self.faults.check("extend")?;
        if let Some(entry) = lock(&self.state).entries.get_mut(&delivery.delivery_id) {
            entry.available_at = Instant::now() + lease;
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let state = lock(&self.state);
        let leased = state
            .entries
            .values()
            .filter(|entry| entry.leased_by.is_some() && entry.available_at > now)
            .count();
        Ok(QueueDepth { pending: state.entries.len() - leased, leased })
    }
}

/// Artifact store backed by a sorted map.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: FaultPlan,
}

impl InMemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.faults.check("get")?;
        lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| OrchestrationError::ArtifactNotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.faults.check("put")?;
        lock(&self.objects).insert(key.to_string(), bytes.to_vec());
        Ok(self.uri(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.faults.check("list")?;
        Ok(lock(&self.objects)
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.faults.check("delete")?;
        lock(&self.objects).remove(key);
        Ok(())
    }

    fn uri(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    runs: BTreeMap<(String, String), ExperimentRun>,
    versions: BTreeMap<(String, String), Vec<ModelVersion>>,
}

/// Experiment registry backed by maps.
#[derive(Debug, Default)]
pub struct InMemoryExperimentRegistry {
    state: Mutex<RegistryState>,
    faults: FaultPlan,
}

impl InMemoryExperimentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }
}

fn pair(experiment_name: &str, model_name: &str) -> (String, String) {
    (experiment_name.to_string(), model_name.to_string())
}

#[async_trait]
impl ExperimentRegistry for InMemoryExperimentRegistry {
    async fn record_run(&self, run: &ExperimentRun) -> Result<()> {
        self.faults.check("record_run")?;
        lock(&self.state)
            .runs
            .insert(pair(&run.experiment_name, &run.run_id), run.clone());
        Ok(())
    }

    async fn list_runs(&self, experiment_name: &str) -> Result<Vec<ExperimentRun>> {
        let state = lock(&self.state);
        let mut runs: Vec<ExperimentRun> = state
            .runs
            .values()
            .filter(|run| run.experiment_name == experiment_name)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(runs)
    }

    async fn create_model_version(&self, new: NewModelVersion) -> Result<ModelVersion> {
        self.faults.check("create_model_version")?;
        let mut state = lock(&self.state);
        let versions =
            state.versions.entry(pair(&new.experiment_name, &new.model_name)).or_default();
        if let Some(existing) = versions.iter().find(|v| v.run_id == new.run_id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let next = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let version = ModelVersion {
            experiment_name: new.experiment_name,
            model_name: new.model_name,
            version: next,
            stage: ModelStage::None,
            artifact_uri: new.artifact_uri,
            run_id: new.run_id,
            hyperparameters: new.hyperparameters,
            metrics: new.metrics,
            tags: new.tags,
            created_at: now,
            updated_at: now,
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn get_version(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
    ) -> Result<Option<ModelVersion>> {
        self.faults.check("get_version")?;
        Ok(lock(&self.state)
            .versions
            .get(&pair(experiment_name, model_name))
            .and_then(|versions| versions.iter().find(|v| v.version == version))
            .cloned())
    }

    async fn list_versions(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> Result<Vec<ModelVersion>> {
        self.faults.check("list_versions")?;
        Ok(lock(&self.state)
            .versions
            .get(&pair(experiment_name, model_name))
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_in_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<ModelVersion>> {
        self.faults.check("latest_in_stage")?;
        Ok(lock(&self.state)
            .versions
            .get(&pair(experiment_name, model_name))
            .and_then(|versions| {
                versions.iter().filter(|v| v.stage == stage).max_by_key(|v| v.version)
            })
            .cloned())
    }

    async fn transition_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
        expected: ModelStage,
        target: ModelStage,
    ) -> Result<StageChange> {
        self.faults.check("transition_stage")?;
        let not_found = || OrchestrationError::ModelNotFound {
            experiment: experiment_name.to_string(),
            model: model_name.to_string(),
            version,
        };

        let mut state = lock(&self.state);
        let versions =
            state.versions.get_mut(&pair(experiment_name, model_name)).ok_or_else(not_found)?;
        let current = versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.stage)
            .ok_or_else(not_found)?;
        if current != expected || !current.can_transition_to(target) {
            return Err(OrchestrationError::InvalidStageTransition { from: current, to: target });
        }

        let now = Utc::now();
        let mut demoted = None;
        if target == ModelStage::Production && current != ModelStage::Production {
            for other in versions
                .iter_mut()
                .filter(|v| v.version != version && v.stage == ModelStage::Production)
            {
                other.stage = ModelStage::Staging;
                other.updated_at = now;
                demoted = Some(other.clone());
            }
        }

        let updated = versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(not_found)?;
        if current != target {
            updated.stage = target;
            updated.updated_at = now;
        }
        Ok(StageChange { previous_stage: current, version: updated.clone(), demoted })
    }
}
