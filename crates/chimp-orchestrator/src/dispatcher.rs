//! Job dispatcher for training runs.
//!
//! Submission persists a queued [`TrainingRun`] and enqueues its id. Workers
//! call [`JobDispatcher::process_next`] to take one delivery off the queue,
//! claim the run with a compare-and-set in the run store, execute the plugin in
//! a scratch directory and publish its results. Duplicate deliveries never
//! re-execute a run that another live worker holds or that already finished.

use crate::error::{OrchestrationError, Result};
use crate::lifecycle::RunStatus;
use crate::progress::ProgressReporter;
use crate::registry::{PluginRegistry, RegisteredPlugin};
use crate::run::{ClaimOutcome, RunCompletion, TrainingRun};
use crate::store::{Delivery, ExperimentRun, NewModelVersion, Stores};
use chimp_training::{
    normalize_prefix, read_artifact, run_artifact_key, sha256_bytes, ArtifactKind,
    DatasetHandle, PluginDescriptor, PluginExecutionError, RunArgs, RunContext, RunManifest,
    RunResult, ScratchDirectory, StoredArtifact, TrainingError,
};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Configuration for the job dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease taken on a delivery and a claimed run; renewed while the plugin runs.
    pub lease_duration: Duration,
    /// Claims allowed before a transient failure becomes terminal.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Parent directory for per-run scratch directories (system temp dir if unset).
    pub scratch_root: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            scratch_root: None,
        }
    }
}

impl DispatcherConfig {
    /// Delay before retrying after `attempt` failed: `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1 << exponent).min(self.backoff_max)
    }
}

/// What one call to [`JobDispatcher::process_next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was deliverable.
    Idle,
    Succeeded {
        run_id: String,
        model_uri: Option<String>,
    },
    Failed {
        run_id: String,
        error: String,
    },
    /// A transient failure; the delivery comes back after `delay`.
    Retrying {
        run_id: String,
        delay: Duration,
        error: String,
    },
    /// A duplicate or stale delivery that was not executed.
    Skipped {
        run_id: String,
        reason: String,
    },
}

/// Submits runs and executes them on behalf of workers.
pub struct JobDispatcher {
    registry: Arc<PluginRegistry>,
    stores: Stores,
    progress: Arc<ProgressReporter>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("plugins", &self.registry.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A finished plugin run whose outputs are uploaded but not yet recorded.
struct Published {
    completion: RunCompletion,
    uploaded: Vec<String>,
}

/// Aborts the lease heartbeat when the run finishes, panics or is dropped.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl JobDispatcher {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, stores: Stores, config: DispatcherConfig) -> Self {
        Self { registry, stores, progress: Arc::new(ProgressReporter::new()), config }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressReporter> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Queues a run of `plugin_name` and returns its id.
    ///
    /// Only presence is checked: every non-optional argument and dataset the
    /// plugin declares must be supplied and non-blank. Values are passed to the
    /// plugin untouched.
    ///
    /// # Errors
    /// `UnknownPlugin`, `InvalidSubmission`, or a store error. A run whose
    /// enqueue fails is withdrawn again.
    pub async fn submit(
        &self,
        plugin_name: &str,
        args: BTreeMap<String, String>,
        dataset_refs: BTreeMap<String, String>,
    ) -> Result<String> {
        let entry = self.registry.get(plugin_name)?;
        let dataset_refs: BTreeMap<String, String> = dataset_refs
            .into_iter()
            .filter(|(_, reference)| !reference.trim().is_empty())
            .collect();
        check_submission(&entry.descriptor, &args, &dataset_refs)?;

        let run = TrainingRun::new(plugin_name, args, dataset_refs);
        self.stores.runs.insert(&run).await?;

        if let Err(err) = self.stores.queue.enqueue(&run.run_id, Duration::ZERO).await {
            error!(run_id = %run.run_id, error = %err, "Failed to enqueue run, withdrawing it");
            if let Err(rollback) = self.stores.runs.withdraw(&run.run_id).await {
                error!(run_id = %run.run_id, error = %rollback, "Failed to withdraw unqueued run");
            }
            return Err(err);
        }

        info!(run_id = %run.run_id, plugin = %plugin_name, "Run queued");
        self.progress.emit_queued(&run.run_id, plugin_name).await;
        Ok(run.run_id)
    }

    /// Current snapshot of a run.
    ///
    /// # Errors
    /// `UnknownRun` if the id was never submitted.
    pub async fn poll(&self, run_id: &str) -> Result<TrainingRun> {
        self.stores
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| OrchestrationError::UnknownRun(run_id.to_string()))
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<TrainingRun>> {
        self.stores.runs.list(status, limit).await
    }

    /// Takes at most one delivery off the queue and sees it through.
    ///
    /// Plugin failures are recorded on the run and reported as
    /// [`ProcessOutcome::Failed`]; only queue or store failures that leave the
    /// delivery unresolved are returned as errors.
    pub async fn process_next(&self, worker_id: &str) -> Result<ProcessOutcome> {
        let lease = self.config.lease_duration;
        let Some(delivery) = self.stores.queue.dequeue(worker_id, lease).await? else {
            return Ok(ProcessOutcome::Idle);
        };
        let run_id = delivery.run_id.clone();
        debug!(
            run_id = %run_id,
            worker_id = %worker_id,
            deliveries = delivery.deliveries,
            "Dequeued run"
        );

        let claim = match self.stores.runs.claim(&run_id, worker_id, lease).await {
            Ok(claim) => claim,
            Err(err) if err.is_retryable() => {
                let delay = self.config.backoff(delivery.deliveries);
                warn!(
                    run_id = %run_id,
                    error = %err,
                    delay_ms = delay.as_millis(),
                    "Claim failed, delivery released"
                );
                self.stores.queue.nack(&delivery, delay).await?;
                return Ok(ProcessOutcome::Retrying { run_id, delay, error: err.to_string() });
            }
            Err(err) => return Err(err),
        };

        match claim {
            ClaimOutcome::Claimed(run) => self.execute(&delivery, run, worker_id).await,
            ClaimOutcome::NotFound => {
                warn!(run_id = %run_id, "Delivery for unknown run dropped");
                self.stores.queue.ack(&delivery).await?;
                Ok(ProcessOutcome::Skipped { run_id, reason: "unknown run".to_string() })
            }
            ClaimOutcome::Finished(status) => {
                info!(
                    run_id = %run_id,
                    status = %status,
                    "Duplicate delivery of finished run acknowledged"
                );
                self.stores.queue.ack(&delivery).await?;
                Ok(ProcessOutcome::Skipped { run_id, reason: format!("run already {status}") })
            }
            ClaimOutcome::HeldByOther { worker_id: holder, lease_expires_at } => {
                // Keep the delivery around until the holder's lease could lapse,
                // so a crashed holder's run is still picked up.
                let remaining = lease_expires_at
                    .and_then(|expires| (expires - Utc::now()).to_std().ok())
                    .unwrap_or_default();
                let delay = remaining.max(self.config.backoff_base);
                info!(
                    run_id = %run_id,
                    holder = %holder,
                    delay_ms = delay.as_millis(),
                    "Run held by another worker, skipping"
                );
                self.stores.queue.nack(&delivery, delay).await?;
                Ok(ProcessOutcome::Skipped { run_id, reason: format!("held by {holder}") })
            }
        }
    }

    async fn execute(
        &self,
        delivery: &Delivery,
        run: TrainingRun,
        worker_id: &str,
    ) -> Result<ProcessOutcome> {
        let run_id = run.run_id.clone();
        info!(
            run_id = %run_id,
            plugin = %run.plugin_name,
            worker_id = %worker_id,
            attempt = run.attempts,
            "Run started"
        );
        self.progress.emit_started(&run_id, worker_id, run.attempts).await;

        let heartbeat = HeartbeatGuard(self.spawn_heartbeat(delivery.clone(), worker_id));
        let outcome = self.run_claimed(&run).await;
        drop(heartbeat);

        match outcome {
            Ok(Published { completion, uploaded }) => {
                match self.stores.runs.complete(&run_id, worker_id, &completion).await {
                    Ok(true) => {}
                    Ok(false) => return self.abandon(delivery, &run_id, worker_id, &uploaded).await,
                    Err(err) => {
                        // Artifacts and the model version stay; a reclaim after the
                        // lease lapses re-runs and re-registers idempotently.
                        error!(run_id = %run_id, error = %err, "Failed to record run completion");
                        return Err(err);
                    }
                }
                self.stores.queue.ack(delivery).await?;
                info!(run_id = %run_id, model_uri = ?completion.result_model_uri, "Run succeeded");
                self.progress
                    .emit_succeeded(&run_id, worker_id, completion.result_model_uri.clone())
                    .await;
                Ok(ProcessOutcome::Succeeded { run_id, model_uri: completion.result_model_uri })
            }
            Err(err) => self.handle_failure(delivery, &run, worker_id, &err).await,
        }
    }

    /// Gives up a run whose claim lapsed or was taken while the plugin ran.
    ///
    /// Uploads are removed unless another worker now holds or finished the run,
    /// since its attempt writes to the same keys. The delivery goes straight
    /// back so the next claim sees the run's current state.
    async fn abandon(
        &self,
        delivery: &Delivery,
        run_id: &str,
        worker_id: &str,
        uploaded: &[String],
    ) -> Result<ProcessOutcome> {
        let current = self.stores.runs.get(run_id).await?;
        let taken_over = current.as_ref().is_some_and(|run| {
            matches!(run.status, RunStatus::Running | RunStatus::Succeeded)
                && run.worker_id.as_deref() != Some(worker_id)
        });
        let status = current.map_or_else(|| "missing".to_string(), |run| run.status.to_string());
        warn!(
            run_id = %run_id,
            worker_id = %worker_id,
            status = %status,
            taken_over,
            "Lost claim before recording completion"
        );

        if !taken_over {
            self.discard_uploads(run_id, uploaded).await;
        }
        self.stores.queue.nack(delivery, Duration::ZERO).await?;
        self.progress.emit_abandoned(run_id, worker_id).await;
        Ok(ProcessOutcome::Skipped {
            run_id: run_id.to_string(),
            reason: format!("claim lost, run is {status}"),
        })
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        run: &TrainingRun,
        worker_id: &str,
        err: &OrchestrationError,
    ) -> Result<ProcessOutcome> {
        let run_id = run.run_id.clone();
        let cause = err.to_string();

        if err.is_retryable() && run.attempts < self.config.max_attempts {
            let delay = self.config.backoff(run.attempts);
            warn!(
                run_id = %run_id,
                attempt = run.attempts,
                delay_ms = delay.as_millis(),
                error = %cause,
                "Transient failure, requeueing run"
            );
            if let Err(requeue_err) = self.stores.runs.requeue(&run_id, worker_id, &cause).await {
                // The claim's lease lapses on its own and the run is reclaimed.
                warn!(run_id = %run_id, error = %requeue_err, "Failed to requeue run");
            }
            self.stores.queue.nack(delivery, delay).await?;
            self.progress.emit_retrying(&run_id, worker_id, run.attempts, delay, &cause).await;
            return Ok(ProcessOutcome::Retrying { run_id, delay, error: cause });
        }

        let cause = if err.is_retryable() {
            format!("gave up after {} attempts: {cause}", run.attempts)
        } else {
            cause
        };
        error!(run_id = %run_id, plugin = %run.plugin_name, error = %cause, "Run failed");
        if !self.stores.runs.fail(&run_id, worker_id, &cause).await? {
            warn!(run_id = %run_id, worker_id = %worker_id, "Lost claim before recording failure");
        }
        self.stores.queue.ack(delivery).await?;
        self.progress.emit_failed(&run_id, worker_id, &cause).await;
        Ok(ProcessOutcome::Failed { run_id, error: cause })
    }

    fn spawn_heartbeat(&self, delivery: Delivery, worker_id: &str) -> JoinHandle<()> {
        let runs = Arc::clone(&self.stores.runs);
        let queue = Arc::clone(&self.stores.queue);
        let lease = self.config.lease_duration;
        let worker_id = worker_id.to_string();
        let period = (lease / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match runs.renew_lease(&delivery.run_id, &worker_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            run_id = %delivery.run_id,
                            worker_id = %worker_id,
                            "Claim lost while running"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(run_id = %delivery.run_id, error = %err, "Lease renewal failed");
                    }
                }
                if let Err(err) = queue.extend(&delivery, lease).await {
                    warn!(
                        run_id = %delivery.run_id,
                        error = %err,
                        "Delivery lease extension failed"
                    );
                }
            }
        })
    }

    async fn run_claimed(&self, run: &TrainingRun) -> Result<Published> {
        let entry = self.registry.get(&run.plugin_name)?;
        let scratch = ScratchDirectory::acquire(self.config.scratch_root.as_deref(), &run.run_id)?;
        let datasets = self.materialize(run, &scratch).await?;
        let args = RunArgs::from(run.submitted_args.clone());

        let ctx = RunContext {
            run_id: &run.run_id,
            args: &args,
            datasets: &datasets,
            workspace: &scratch,
        };
        let result = match AssertUnwindSafe(entry.plugin.run(&ctx)).catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => {
                let cause = format!("plugin panicked: {}", panic_message(panic.as_ref()));
                return Err(PluginExecutionError::new(cause).into());
            }
        };

        let mut uploaded = Vec::new();
        match self.publish(run, entry, &scratch, &result, &mut uploaded).await {
            Ok(completion) => Ok(Published { completion, uploaded }),
            Err(err) => {
                self.discard_uploads(&run.run_id, &uploaded).await;
                Err(err)
            }
        }
    }

    /// Copies every referenced dataset into the scratch directory.
    ///
    /// A reference is treated as a key prefix; if nothing lives under it, it is
    /// fetched as a single object.
    async fn materialize(
        &self,
        run: &TrainingRun,
        scratch: &ScratchDirectory,
    ) -> Result<BTreeMap<String, DatasetHandle>> {
        let mut datasets = BTreeMap::new();
        for (name, reference) in &run.dataset_refs {
            let dir = scratch.dataset_dir(name);
            tokio::fs::create_dir_all(&dir).await?;

            let prefix = normalize_prefix(reference);
            let keys = self.stores.artifacts.list(&prefix).await?;
            let files = if keys.is_empty() {
                let key = reference.trim_end_matches('/');
                let bytes = self.stores.artifacts.get(key).await.map_err(|err| match err {
                    OrchestrationError::ArtifactNotFound(_) => OrchestrationError::ArtifactNotFound(
                        format!("dataset '{name}' has nothing at '{reference}'"),
                    ),
                    other => other,
                })?;
                let file_name = key.rsplit('/').next().unwrap_or(key);
                write_dataset_file(&dir, file_name, &bytes).await?;
                1
            } else {
                for key in &keys {
                    let bytes = self.stores.artifacts.get(key).await?;
                    write_dataset_file(&dir, &key[prefix.len()..], &bytes).await?;
                }
                keys.len()
            };

            debug!(
                run_id = %run.run_id,
                dataset = %name,
                source = %reference,
                files,
                "Materialized dataset"
            );
            datasets.insert(
                name.clone(),
                DatasetHandle { name: name.clone(), source: reference.clone(), path: dir, files },
            );
        }
        Ok(datasets)
    }

    /// Uploads the run's outputs and records it in the experiment registry.
    async fn publish(
        &self,
        run: &TrainingRun,
        entry: &RegisteredPlugin,
        scratch: &ScratchDirectory,
        result: &RunResult,
        uploaded: &mut Vec<String>,
    ) -> Result<RunCompletion> {
        let (experiment_name, model_name) = result.lineage(&run.plugin_name);
        let mut stored = Vec::new();
        let mut model_uri = None;

        if let Some(model) = &result.model {
            let artifact = self
                .upload_file(run, scratch, &model.path, "model", ArtifactKind::Model, uploaded)
                .await?;
            model_uri = Some(artifact.uri.clone());
            stored.push(artifact);
        }
        for (name, path) in &result.artifacts {
            let dir = format!("artifacts/{name}");
            let artifact = self
                .upload_file(run, scratch, path, &dir, ArtifactKind::Auxiliary, uploaded)
                .await?;
            stored.push(artifact);
        }

        let manifest = RunManifest {
            run_id: run.run_id.clone(),
            plugin_name: run.plugin_name.clone(),
            created_at: Utc::now(),
            model_type: result.model.as_ref().map(|model| model.model_type),
            metrics: result.metrics.clone(),
            hyperparameters: result.hyperparameters.clone(),
            artifacts: stored,
        };
        let manifest_key = run_artifact_key(&run.run_id, "manifest.json");
        self.stores.artifacts.put(&manifest_key, &serde_json::to_vec_pretty(&manifest)?).await?;
        uploaded.push(manifest_key);

        let mut tags = result.tags.clone();
        tags.insert("plugin".to_string(), run.plugin_name.clone());
        tags.insert("plugin_version".to_string(), entry.descriptor.version.clone());

        self.stores
            .experiments
            .record_run(&ExperimentRun {
                run_id: run.run_id.clone(),
                experiment_name: experiment_name.clone(),
                plugin_name: run.plugin_name.clone(),
                metrics: result.metrics.clone(),
                hyperparameters: result.hyperparameters.clone(),
                tags: tags.clone(),
                recorded_at: Utc::now(),
            })
            .await?;

        let mut model_version = None;
        if let (Some(uri), Some(model)) = (&model_uri, &result.model) {
            let mut version_tags = tags.clone();
            version_tags.insert("model_type".to_string(), model.model_type.to_string());
            let version = self
                .stores
                .experiments
                .create_model_version(NewModelVersion {
                    experiment_name: experiment_name.clone(),
                    model_name,
                    artifact_uri: uri.clone(),
                    run_id: run.run_id.clone(),
                    hyperparameters: result.hyperparameters.clone(),
                    metrics: result.metrics.clone(),
                    tags: version_tags,
                })
                .await?;
            info!(
                run_id = %run.run_id,
                experiment = %experiment_name,
                model = %version.model_name,
                version = version.version,
                "Registered model version"
            );
            model_version = Some(version.version);
        }

        Ok(RunCompletion {
            result_model_uri: model_uri,
            metrics: result.metrics.clone(),
            hyperparameters: result.hyperparameters.clone(),
            tags,
            experiment_name: Some(experiment_name),
            model_version,
        })
    }

    async fn upload_file(
        &self,
        run: &TrainingRun,
        scratch: &ScratchDirectory,
        path: &Path,
        dir: &str,
        kind: ArtifactKind,
        uploaded: &mut Vec<String>,
    ) -> Result<StoredArtifact> {
        let resolved = scratch.resolve(path).ok_or_else(|| {
            PluginExecutionError::new(format!(
                "artifact {} is not a file inside the run's scratch directory",
                path.display()
            ))
        })?;
        let bytes = read_artifact(&resolved).map_err(PluginExecutionError::from)?;
        let file_name = resolved
            .file_name()
            .map_or_else(|| "artifact".to_string(), |name| name.to_string_lossy().into_owned());

        let key = run_artifact_key(&run.run_id, &format!("{dir}/{file_name}"));
        let uri = self.stores.artifacts.put(&key, &bytes).await?;
        uploaded.push(key.clone());
        debug!(run_id = %run.run_id, key = %key, bytes = bytes.len(), "Uploaded artifact");

        Ok(StoredArtifact {
            kind,
            key,
            uri,
            sha256: sha256_bytes(&bytes),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn discard_uploads(&self, run_id: &str, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.stores.artifacts.delete(key).await {
                warn!(
                    run_id = %run_id,
                    key = %key,
                    error = %err,
                    "Failed to delete partial upload"
                );
            }
        }
    }
}

/// Structural presence check against the plugin's declared contract.
fn check_submission(
    descriptor: &PluginDescriptor,
    args: &BTreeMap<String, String>,
    dataset_refs: &BTreeMap<String, String>,
) -> Result<()> {
    let missing_args: Vec<&str> = descriptor
        .required_arguments()
        .filter(|spec| args.get(&spec.name).is_none_or(|value| value.trim().is_empty()))
        .map(|spec| spec.name.as_str())
        .collect();
    let missing_datasets: Vec<&str> = descriptor
        .required_datasets()
        .filter(|spec| !dataset_refs.contains_key(&spec.name))
        .map(|spec| spec.name.as_str())
        .collect();

    let mut problems = Vec::new();
    if !missing_args.is_empty() {
        problems.push(format!("missing required arguments: {}", missing_args.join(", ")));
    }
    if !missing_datasets.is_empty() {
        problems.push(format!("missing required datasets: {}", missing_datasets.join(", ")));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(OrchestrationError::InvalidSubmission {
            plugin: descriptor.name.clone(),
            reason: problems.join("; "),
        })
    }
}

async fn write_dataset_file(dir: &Path, relative: &str, bytes: &[u8]) -> Result<()> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty()
        || !relative.components().all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(TrainingError::Artifact(format!(
            "refusing to materialize '{}' outside the dataset directory",
            relative.display()
        ))
        .into());
    }
    let target = dir.join(relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, bytes).await?;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ArtifactStore, ExperimentRegistry, InMemoryArtifactStore, InMemoryExperimentRegistry,
        InMemoryRunStore, InMemoryWorkQueue, QueueDepth, RunStore, WorkQueue,
    };
    use crate::testing::StaticPlugin;
    use chimp_training::{ArgumentSpec, DatasetSpec, TrainingPlugin};

    struct Harness {
        dispatcher: JobDispatcher,
        runs: Arc<InMemoryRunStore>,
        queue: Arc<InMemoryWorkQueue>,
        artifacts: Arc<InMemoryArtifactStore>,
        experiments: Arc<InMemoryExperimentRegistry>,
    }

    fn descriptor(name: &str) -> PluginDescriptor {
        PluginDescriptor::new(name, "1.0", "test")
            .with_argument(ArgumentSpec::required("user_id", "str", "user"))
            .with_argument(ArgumentSpec::optional("epochs", "int", "epochs"))
            .with_dataset(DatasetSpec::optional("images", "images"))
    }

    fn harness(plugins: Vec<Arc<dyn TrainingPlugin>>, config: DispatcherConfig) -> Harness {
        let mut registry = PluginRegistry::new();
        let report = registry.load(plugins);
        assert!(report.rejected.is_empty());

        let runs = Arc::new(InMemoryRunStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let experiments = Arc::new(InMemoryExperimentRegistry::new());
        let stores = Stores {
            runs: runs.clone(),
            queue: queue.clone(),
            artifacts: artifacts.clone(),
            experiments: experiments.clone(),
        };
        Harness {
            dispatcher: JobDispatcher::new(Arc::new(registry), stores, config),
            runs,
            queue,
            artifacts,
            experiments,
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            lease_duration: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            scratch_root: None,
        }
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            ..DispatcherConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(10));
        assert_eq!(config.backoff(200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_submit_unknown_plugin() {
        let h = harness(vec![], fast_config());
        let err = h.dispatcher.submit("nope", BTreeMap::new(), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownPlugin(_)));
    }

    #[tokio::test]
    async fn test_submit_missing_required_argument() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin], fast_config());

        let err = h
            .dispatcher
            .submit("faces", args(&[("user_id", "  "), ("epochs", "3")]), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidSubmission { ref reason, .. } if reason.contains("user_id")
        ));
        assert_eq!(h.queue.depth().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_submit_rolls_back_when_enqueue_fails() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin], fast_config());
        h.queue.faults().fail_next("enqueue", 1);

        let err = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.runs.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_run_uploads_model_and_registers_version() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")).with_model());
        let h = harness(vec![plugin.clone()], fast_config());
        h.artifacts.put("datasets/faces/happy/1.png", b"a").await.unwrap();
        h.artifacts.put("datasets/faces/sad/2.png", b"b").await.unwrap();

        let run_id = h
            .dispatcher
            .submit(
                "faces",
                args(&[("user_id", "u1"), ("epochs", "4")]),
                args(&[("images", "datasets/faces")]),
            )
            .await
            .unwrap();
        let outcome = h.dispatcher.process_next("w-1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Succeeded { .. }));

        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.model_version, Some(1));
        assert_eq!(run.hyperparameters.get("epochs").map(String::as_str), Some("4"));
        let uri = run.result_model_uri.unwrap();
        assert_eq!(uri, format!("memory://runs/{run_id}/model/model.bin"));

        let model = h.artifacts.get(&format!("runs/{run_id}/model/model.bin")).await.unwrap();
        assert_eq!(model, run_id.as_bytes());
        assert!(h.artifacts.get(&format!("runs/{run_id}/manifest.json")).await.is_ok());

        let seen = plugin.seen_datasets();
        assert_eq!(seen["images"], vec!["happy/1.png".to_string(), "sad/2.png".to_string()]);

        let versions = h.experiments.list_versions("faces", "faces").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].run_id, run_id);
        assert_eq!(h.experiments.list_runs("faces").await.unwrap().len(), 1);
        assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_plugin_failure_is_terminal_and_uploads_nothing() {
        let plugin =
            Arc::new(StaticPlugin::new(descriptor("faces")).with_model().failing("bad labels"));
        let h = harness(vec![plugin.clone()], fast_config());

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        let outcome = h.dispatcher.process_next("w-1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("bad labels"));
        assert!(run.result_model_uri.is_none());
        assert!(h.artifacts.list(&format!("runs/{run_id}/")).await.unwrap().is_empty());
        assert_eq!(plugin.executions(), 1);
        assert_eq!(h.dispatcher.process_next("w-1").await.unwrap(), ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn test_plugin_panic_is_contained() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")).panicking());
        let h = harness(vec![plugin], fast_config());

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        h.dispatcher.process_next("w-1").await.unwrap();

        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("panicked on purpose"));
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_run() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin.clone()], fast_config());

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), args(&[("images", "datasets/none")]))
            .await
            .unwrap();
        h.dispatcher.process_next("w-1").await.unwrap();

        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("datasets/none"));
        assert_eq!(plugin.executions(), 0);
    }

    #[tokio::test]
    async fn test_transient_upload_failure_is_retried() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")).with_model());
        let h = harness(vec![plugin.clone()], fast_config());
        h.artifacts.faults().fail_next("put", 1);

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();

        let first = h.dispatcher.process_next("w-1").await.unwrap();
        assert!(matches!(first, ProcessOutcome::Retrying { .. }));
        let queued = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(queued.status, RunStatus::Queued);
        assert!(queued.error.unwrap().contains("injected failure"));

        let second = h.dispatcher.process_next("w-2").await.unwrap();
        assert!(matches!(second, ProcessOutcome::Succeeded { .. }));
        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempts, 2);
        assert_eq!(plugin.executions(), 2);
    }

    #[tokio::test]
    async fn test_partial_uploads_are_removed_before_retry() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")).with_model());
        let h = harness(vec![plugin], DispatcherConfig { max_attempts: 1, ..fast_config() });
        h.experiments.faults().fail_next("record_run", 1);

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        let outcome = h.dispatcher.process_next("w-1").await.unwrap();

        let ProcessOutcome::Failed { ref error, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(error.starts_with("gave up after 1 attempts"));
        assert!(h.artifacts.is_empty());
        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_of_finished_run_is_skipped() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin.clone()], fast_config());

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        h.queue.enqueue(&run_id, Duration::ZERO).await.unwrap();

        assert!(matches!(
            h.dispatcher.process_next("w-1").await.unwrap(),
            ProcessOutcome::Succeeded { .. }
        ));
        assert!(matches!(
            h.dispatcher.process_next("w-2").await.unwrap(),
            ProcessOutcome::Skipped { .. }
        ));
        assert_eq!(plugin.executions(), 1);
        assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin.clone()], fast_config());

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        // A worker that claimed the run and died without renewing its lease.
        h.runs.claim(&run_id, "dead-worker", Duration::ZERO).await.unwrap();

        let outcome = h.dispatcher.process_next("w-1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Succeeded { .. }));
        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.worker_id.as_deref(), Some("w-1"));
        assert_eq!(run.attempts, 2);
        assert_eq!(plugin.executions(), 1);
    }

    #[tokio::test]
    async fn test_racing_workers_execute_run_once() {
        let plugin =
            Arc::new(StaticPlugin::new(descriptor("faces")).with_delay(Duration::from_millis(50)));
        let h = Arc::new(harness(vec![plugin.clone()], fast_config()));

        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();
        for _ in 0..7 {
            h.queue.enqueue(&run_id, Duration::ZERO).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                h.dispatcher.process_next(&format!("w-{n}")).await.unwrap()
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ProcessOutcome::Succeeded { .. }) {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(plugin.executions(), 1);
        assert_eq!(h.dispatcher.poll(&run_id).await.unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_run_failed_while_plugin_runs_is_not_reported_as_success() {
        let plugin = Arc::new(
            StaticPlugin::new(descriptor("faces"))
                .with_model()
                .with_delay(Duration::from_millis(200)),
        );
        let h = Arc::new(harness(vec![plugin.clone()], fast_config()));
        let run_id = h
            .dispatcher
            .submit("faces", args(&[("user_id", "u1")]), BTreeMap::new())
            .await
            .unwrap();

        let worker = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.dispatcher.process_next("w-1").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.runs.fail(&run_id, "w-1", "cancelled by operator").await.unwrap());

        let outcome = worker.await.unwrap();
        assert!(
            matches!(
                outcome,
                ProcessOutcome::Skipped { ref reason, .. } if reason.contains("failed")
            ),
            "unexpected outcome {outcome:?}"
        );
        let run = h.dispatcher.poll(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.result_model_uri.is_none());
        assert!(h.artifacts.list(&format!("runs/{run_id}/")).await.unwrap().is_empty());
        assert_eq!(h.dispatcher.progress().snapshot().await.succeeded, 0);
        assert_eq!(h.dispatcher.progress().snapshot().await.running, 0);

        // The returned delivery is acknowledged as a finished run.
        assert!(matches!(
            h.dispatcher.process_next("w-2").await.unwrap(),
            ProcessOutcome::Skipped { .. }
        ));
        assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
        assert_eq!(plugin.executions(), 1);
    }

    #[tokio::test]
    async fn test_progress_counts_submitted_and_finished_runs() {
        let plugin = Arc::new(StaticPlugin::new(descriptor("faces")));
        let h = harness(vec![plugin], fast_config());
        h.dispatcher.submit("faces", args(&[("user_id", "u1")]), BTreeMap::new()).await.unwrap();
        h.dispatcher.process_next("w-1").await.unwrap();

        let metrics = h.dispatcher.progress().snapshot().await;
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.running, 0);
    }
}
