//! Serving-side lookup of the model to use for inference.
//!
//! Global models are resolved by stage. A caller that knows the user (or the
//! calibration run) asks for the calibrated model first and falls back to the
//! global one when that user has none.

use std::sync::Arc;

use chimp_orchestrator::{ExperimentRegistry, ModelStage, ModelVersion, Result, RunStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The model a serving component should load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub experiment_name: String,
    pub model_name: String,
    pub version: u32,
    pub stage: ModelStage,
    pub artifact_uri: String,
    /// Whether this is a per-user calibrated model rather than the global one.
    #[serde(default)]
    pub calibrated: bool,
}

impl From<ModelVersion> for ResolvedModel {
    fn from(version: ModelVersion) -> Self {
        Self {
            experiment_name: version.experiment_name,
            model_name: version.model_name,
            version: version.version,
            stage: version.stage,
            artifact_uri: version.artifact_uri,
            calibrated: false,
        }
    }
}

/// Which calibrated model to try before the global one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calibration<'a> {
    /// The newest model trained for this user.
    User(&'a str),
    /// The model registered by this run.
    Run(&'a str),
}

/// Experiment that tracks `user`'s calibrated models of `experiment_name`.
#[must_use]
pub fn calibrated_experiment(experiment_name: &str, user: &str) -> String {
    format!("{experiment_name}_calib_{user}")
}

/// Answers "which model is live" from the experiment registry.
pub struct ProductionModelResolver {
    registry: Arc<dyn ExperimentRegistry>,
    runs: Arc<dyn RunStore>,
}

impl std::fmt::Debug for ProductionModelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionModelResolver").finish_non_exhaustive()
    }
}

impl ProductionModelResolver {
    #[must_use]
    pub fn new(registry: Arc<dyn ExperimentRegistry>, runs: Arc<dyn RunStore>) -> Self {
        Self { registry, runs }
    }

    /// Latest version of `experiment/model` in `stage`, if any.
    pub async fn resolve(
        &self,
        experiment_name: &str,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<ResolvedModel>> {
        let resolved = self
            .registry
            .latest_in_stage(experiment_name, model_name, stage)
            .await?
            .map(ResolvedModel::from);
        debug!(
            experiment = %experiment_name,
            model = %model_name,
            stage = %stage,
            version = ?resolved.as_ref().map(|m| m.version),
            "Resolved model"
        );
        Ok(resolved)
    }

    /// The calibrated model picked by `calibration`, else the global model in
    /// `stage`.
    ///
    /// Calibrated models are used whatever their stage. A run id only counts
    /// when that run registered a version of `model_name` under
    /// `experiment_name` or one of its calibrated experiments.
    pub async fn resolve_calibrated(
        &self,
        experiment_name: &str,
        model_name: &str,
        stage: ModelStage,
        calibration: Calibration<'_>,
    ) -> Result<Option<ResolvedModel>> {
        let calibrated = match calibration {
            Calibration::User(user) => {
                let experiment = calibrated_experiment(experiment_name, user);
                self.registry.list_versions(&experiment, model_name).await?.pop()
            }
            Calibration::Run(run_id) => {
                self.run_version(experiment_name, model_name, run_id).await?
            }
        };

        if let Some(version) = calibrated {
            debug!(
                experiment = %version.experiment_name,
                model = %model_name,
                version = version.version,
                "Resolved calibrated model"
            );
            return Ok(Some(ResolvedModel { calibrated: true, ..ResolvedModel::from(version) }));
        }
        debug!(
            experiment = %experiment_name,
            model = %model_name,
            ?calibration,
            "No calibrated model, using global"
        );
        self.resolve(experiment_name, model_name, stage).await
    }

    async fn run_version(
        &self,
        experiment_name: &str,
        model_name: &str,
        run_id: &str,
    ) -> Result<Option<ModelVersion>> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Ok(None);
        };
        let (Some(experiment), Some(version)) = (run.experiment_name, run.model_version) else {
            return Ok(None);
        };
        let calibrated_prefix = format!("{experiment_name}_calib_");
        if experiment != experiment_name && !experiment.starts_with(&calibrated_prefix) {
            return Ok(None);
        }
        self.registry.get_version(&experiment, model_name, version).await
    }

    /// Artifact URI of the current production model.
    pub async fn production_uri(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .resolve(experiment_name, model_name, ModelStage::Production)
            .await?
            .map(|model| model.artifact_uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimp_orchestrator::store::{InMemoryExperimentRegistry, InMemoryRunStore};
    use chimp_orchestrator::{NewModelVersion, RunCompletion, TrainingRun};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const EXPERIMENT: &str = "emotion_recognition";
    const MODEL: &str = "emotion_model";

    async fn register(registry: &InMemoryExperimentRegistry, experiment: &str, run: &str) -> u32 {
        registry
            .create_model_version(NewModelVersion {
                experiment_name: experiment.to_string(),
                model_name: MODEL.to_string(),
                artifact_uri: format!("file:///artifacts/runs/{run}/model/model.json"),
                run_id: run.to_string(),
                ..NewModelVersion::default()
            })
            .await
            .unwrap()
            .version
    }

    /// A finished run that registered `experiment` version `version`.
    async fn finished_run(runs: &InMemoryRunStore, experiment: &str, version: u32) -> String {
        let run = TrainingRun::new("emotion_recognition", BTreeMap::new(), BTreeMap::new());
        runs.insert(&run).await.unwrap();
        runs.claim(&run.run_id, "w-1", Duration::from_secs(30)).await.unwrap();
        let completion = RunCompletion {
            experiment_name: Some(experiment.to_string()),
            model_version: Some(version),
            ..RunCompletion::default()
        };
        assert!(runs.complete(&run.run_id, "w-1", &completion).await.unwrap());
        run.run_id
    }

    async fn resolve(
        resolver: &ProductionModelResolver,
        calibration: Calibration<'_>,
    ) -> ResolvedModel {
        resolver
            .resolve_calibrated(EXPERIMENT, MODEL, ModelStage::Production, calibration)
            .await
            .unwrap()
            .unwrap()
    }

    async fn with_global_production(registry: &Arc<InMemoryExperimentRegistry>) {
        register(registry, EXPERIMENT, "global").await;
        registry
            .transition_stage(EXPERIMENT, MODEL, 1, ModelStage::None, ModelStage::Staging)
            .await
            .unwrap();
        registry
            .transition_stage(EXPERIMENT, MODEL, 1, ModelStage::Staging, ModelStage::Production)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_by_stage() {
        let registry = Arc::new(InMemoryExperimentRegistry::new());
        for run in ["r1", "r2"] {
            register(&registry, EXPERIMENT, run).await;
        }
        let resolver =
            ProductionModelResolver::new(registry.clone(), Arc::new(InMemoryRunStore::new()));
        assert!(resolver.production_uri(EXPERIMENT, MODEL).await.unwrap().is_none());

        for v in [1, 2] {
            registry
                .transition_stage(EXPERIMENT, MODEL, v, ModelStage::None, ModelStage::Staging)
                .await
                .unwrap();
        }
        registry
            .transition_stage(EXPERIMENT, MODEL, 1, ModelStage::Staging, ModelStage::Production)
            .await
            .unwrap();

        let staging = resolver.resolve(EXPERIMENT, MODEL, ModelStage::Staging).await.unwrap();
        assert_eq!(staging.map(|m| m.version), Some(2));
        assert_eq!(
            resolver.production_uri(EXPERIMENT, MODEL).await.unwrap().as_deref(),
            Some("file:///artifacts/runs/r1/model/model.json")
        );
    }

    #[tokio::test]
    async fn test_user_with_calibrated_model_gets_newest_one() {
        let registry = Arc::new(InMemoryExperimentRegistry::new());
        with_global_production(&registry).await;
        let calibrated = calibrated_experiment(EXPERIMENT, "alice");
        register(&registry, &calibrated, "alice-1").await;
        register(&registry, &calibrated, "alice-2").await;
        let resolver = ProductionModelResolver::new(registry, Arc::new(InMemoryRunStore::new()));

        let model = resolve(&resolver, Calibration::User("alice")).await;
        assert!(model.calibrated);
        assert_eq!(model.experiment_name, "emotion_recognition_calib_alice");
        assert_eq!(model.version, 2);
        assert_eq!(model.stage, ModelStage::None);
    }

    #[tokio::test]
    async fn test_user_without_calibrated_model_falls_back_to_global() {
        let registry = Arc::new(InMemoryExperimentRegistry::new());
        with_global_production(&registry).await;
        let resolver = ProductionModelResolver::new(registry, Arc::new(InMemoryRunStore::new()));

        let model = resolve(&resolver, Calibration::User("bob")).await;
        assert!(!model.calibrated);
        assert_eq!(model.experiment_name, EXPERIMENT);
        assert_eq!(model.stage, ModelStage::Production);
    }

    #[tokio::test]
    async fn test_run_id_resolves_that_runs_model() {
        let registry = Arc::new(InMemoryExperimentRegistry::new());
        let runs = Arc::new(InMemoryRunStore::new());
        with_global_production(&registry).await;
        let calibrated = calibrated_experiment(EXPERIMENT, "alice");
        let version = register(&registry, &calibrated, "alice-1").await;
        let run_id = finished_run(&runs, &calibrated, version).await;
        let other = finished_run(&runs, "unrelated", 1).await;
        let resolver = ProductionModelResolver::new(registry, runs);

        let model = resolve(&resolver, Calibration::Run(&run_id)).await;
        assert!(model.calibrated);
        assert_eq!(model.artifact_uri, "file:///artifacts/runs/alice-1/model/model.json");

        for run in [other.as_str(), "no-such-run"] {
            let model = resolve(&resolver, Calibration::Run(run)).await;
            assert!(!model.calibrated);
            assert_eq!(model.experiment_name, EXPERIMENT);
        }
    }
}
