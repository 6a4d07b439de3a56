//! Model promotion workflow.
//!
//! Stage changes go through the experiment registry's compare-and-set
//! [`transition_stage`](crate::store::ExperimentRegistry::transition_stage), so two
//! concurrent promotions to production can never leave two production versions.

use crate::error::{OrchestrationError, Result};
use crate::lifecycle::ModelStage;
use crate::store::{ExperimentRegistry, ModelVersion, StageChange};
use std::sync::Arc;
use tracing::info;

/// Moves model versions between stages.
pub struct PromotionWorkflow {
    registry: Arc<dyn ExperimentRegistry>,
}

impl std::fmt::Debug for PromotionWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionWorkflow").finish_non_exhaustive()
    }
}

impl PromotionWorkflow {
    #[must_use]
    pub fn new(registry: Arc<dyn ExperimentRegistry>) -> Self {
        Self { registry }
    }

    /// Moves `version` to `target`.
    ///
    /// Re-promoting to the current stage succeeds without changes. Promoting to
    /// production demotes the previous production version to staging.
    ///
    /// # Errors
    /// `ModelNotFound` if the version does not exist, `InvalidStageTransition`
    /// if `target` is not reachable from its current stage (or the stage
    /// changed underneath us).
    pub async fn promote(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
        target: ModelStage,
    ) -> Result<StageChange> {
        let current = self
            .registry
            .get_version(experiment_name, model_name, version)
            .await?
            .ok_or_else(|| OrchestrationError::ModelNotFound {
                experiment: experiment_name.to_string(),
                model: model_name.to_string(),
                version,
            })?;

        if current.stage == target {
            return Ok(StageChange {
                previous_stage: current.stage,
                version: current,
                demoted: None,
            });
        }
        if !current.stage.can_transition_to(target) {
            return Err(OrchestrationError::InvalidStageTransition {
                from: current.stage,
                to: target,
            });
        }

        let change = self
            .registry
            .transition_stage(experiment_name, model_name, version, current.stage, target)
            .await?;
        info!(
            experiment = %experiment_name,
            model = %model_name,
            version,
            from = %change.previous_stage,
            to = %target,
            demoted = ?change.demoted.as_ref().map(|v| v.version),
            "Model version stage changed"
        );
        Ok(change)
    }

    pub async fn list_versions(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> Result<Vec<ModelVersion>> {
        self.registry.list_versions(experiment_name, model_name).await
    }

    pub async fn get_version(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
    ) -> Result<Option<ModelVersion>> {
        self.registry.get_version(experiment_name, model_name, version).await
    }

    pub async fn production_version(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> Result<Option<ModelVersion>> {
        self.registry.production_version(experiment_name, model_name).await
    }
}
