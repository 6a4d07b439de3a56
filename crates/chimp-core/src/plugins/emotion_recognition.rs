//! Emotion recognition plugin.
//!
//! Collects labelled face samples from two optional datasets and publishes a
//! class-prior model:
//! - `emotions`: an uploaded image dataset laid out as `train/<category>/<file>`
//! - `calibration`: calibration session archives (`*.tar.gz`) of one user
//!
//! Fitting the actual network happens outside this service; what matters here
//! is the contract: validated inputs, a model file in the scratch directory,
//! metrics, and per-user experiment naming.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chimp_training::{
    read_archive, ArgumentSpec, CategorySet, DatasetHandle, DatasetSpec, ModelArtifact, ModelType,
    PluginDescriptor, PluginExecutionError, PluginResult, RunContext, RunResult, TrainingPlugin,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::serving::calibrated_experiment;

pub const PLUGIN_NAME: &str = "emotion_recognition";
pub const EMOTIONS_DATASET: &str = "emotions";
pub const CALIBRATION_DATASET: &str = "calibration";
pub const MODEL_NAME: &str = "emotion_model";

/// What the plugin writes to `output/model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionPriorModel {
    pub user_id: Option<String>,
    pub categories: Vec<String>,
    pub counts: BTreeMap<String, usize>,
    pub priors: BTreeMap<String, f64>,
    pub epochs: u32,
    pub learning_rate: f64,
}

/// Trains per-user (or global) emotion models from calibration data.
#[derive(Debug, Clone)]
pub struct EmotionRecognitionPlugin {
    categories: CategorySet,
}

impl Default for EmotionRecognitionPlugin {
    fn default() -> Self {
        Self::new(CategorySet::default())
    }
}

impl EmotionRecognitionPlugin {
    #[must_use]
    pub fn new(categories: CategorySet) -> Self {
        Self { categories }
    }

    /// Experiment a run's model is tracked under.
    #[must_use]
    pub fn experiment_for(user_id: Option<&str>) -> String {
        match user_id.map(str::trim).filter(|u| !u.is_empty()) {
            Some(user) => calibrated_experiment(PLUGIN_NAME, user),
            None => PLUGIN_NAME.to_string(),
        }
    }

    fn count_image_dataset(
        &self,
        root: &Path,
        counts: &mut BTreeMap<String, usize>,
    ) -> PluginResult<()> {
        let train = root.join("train");
        if !train.is_dir() {
            return Err(PluginExecutionError::new(format!(
                "dataset '{EMOTIONS_DATASET}' has no train/ directory"
            )));
        }
        for category in self.categories.labels() {
            let dir = train.join(category);
            if !dir.is_dir() {
                continue;
            }
            let files = std::fs::read_dir(&dir)?
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.path().is_file())
                .count();
            *counts.entry(category.clone()).or_default() += files;
        }
        Ok(())
    }

    fn count_calibration_archives(
        &self,
        files: &[std::path::PathBuf],
        user_id: Option<&str>,
        counts: &mut BTreeMap<String, usize>,
    ) -> PluginResult<()> {
        for path in files.iter().filter(|p| p.to_string_lossy().ends_with(".tar.gz")) {
            let bytes = std::fs::read(path)?;
            let (owner, samples) = read_archive(&bytes)?;
            if let Some(user) = user_id {
                if owner != user {
                    debug!(
                        archive = %path.display(),
                        owner = %owner,
                        "Skipping archive of another user"
                    );
                    continue;
                }
            }
            for sample in samples {
                self.categories.validate(&sample.label)?;
                *counts.entry(sample.label).or_default() += 1;
            }
        }
        Ok(())
    }

    /// Labelled samples per category across both datasets.
    fn count_samples(
        &self,
        emotions: Option<&DatasetHandle>,
        calibration: Option<&DatasetHandle>,
        user_id: Option<&str>,
    ) -> PluginResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        if let Some(dataset) = emotions {
            self.count_image_dataset(dataset.path(), &mut counts)?;
        }
        if let Some(dataset) = calibration {
            self.count_calibration_archives(&dataset.list_files()?, user_id, &mut counts)?;
        }
        Ok(counts)
    }
}

#[async_trait]
impl TrainingPlugin for EmotionRecognitionPlugin {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PLUGIN_NAME,
            "1.0",
            "An emotion recognition model, optionally calibrated per user.",
        )
        .with_argument(ArgumentSpec::optional(
            "user_id",
            "str",
            "User to calibrate for; global model when empty",
        ))
        .with_argument(ArgumentSpec::optional("epochs", "int", "Training epochs (default 10)"))
        .with_argument(ArgumentSpec::optional(
            "learning_rate",
            "float",
            "Optimizer learning rate (default 0.001)",
        ))
        .with_dataset(DatasetSpec::optional(
            EMOTIONS_DATASET,
            "Face images under train/<category>/",
        ))
        .with_dataset(DatasetSpec::optional(CALIBRATION_DATASET, "Calibration session archives"))
        .with_model_return_type(ModelType::Other)
        .with_categories(self.categories.labels().iter())
    }

    async fn run(&self, ctx: &RunContext<'_>) -> PluginResult<RunResult> {
        let user_id = ctx.args.get("user_id").map(str::trim).filter(|u| !u.is_empty());
        let epochs: u32 = ctx.args.parse_or("epochs", 10)?;
        let learning_rate: f64 = ctx.args.parse_or("learning_rate", 0.001)?;
        if epochs == 0 {
            return Err(PluginExecutionError::new("argument 'epochs' must be positive"));
        }
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(PluginExecutionError::new(
                "argument 'learning_rate' must be a positive number",
            ));
        }

        let counts = {
            let plugin = self.clone();
            let emotions = ctx.datasets.get(EMOTIONS_DATASET).cloned();
            let calibration = ctx.datasets.get(CALIBRATION_DATASET).cloned();
            let user = user_id.map(str::to_string);
            tokio::task::spawn_blocking(move || {
                plugin.count_samples(emotions.as_ref(), calibration.as_ref(), user.as_deref())
            })
            .await
            .map_err(|err| PluginExecutionError::new(format!("sample counting aborted: {err}")))??
        };

        let total: usize = counts.values().sum();
        if total == 0 {
            return Err(PluginExecutionError::new(
                "no labelled samples found in the provided datasets",
            ));
        }

        let priors: BTreeMap<String, f64> = self
            .categories
            .labels()
            .iter()
            .map(|label| {
                let n = counts.get(label).copied().unwrap_or(0);
                (label.clone(), n as f64 / total as f64)
            })
            .collect();
        let majority = priors.values().copied().fold(0.0_f64, f64::max);
        let covered = counts.values().filter(|n| **n > 0).count();

        let model = EmotionPriorModel {
            user_id: user_id.map(str::to_string),
            categories: self.categories.labels().to_vec(),
            counts,
            priors,
            epochs,
            learning_rate,
        };
        let model_path = ctx.workspace.output_dir().join("model.json");
        tokio::fs::write(&model_path, serde_json::to_vec_pretty(&model)?).await?;

        info!(
            run_id = %ctx.run_id,
            samples = total,
            user_id = ?user_id,
            "Emotion prior model written"
        );

        let mut result = RunResult::default()
            .with_model(ModelArtifact::new(model_path, ModelType::Other))
            .with_experiment(Self::experiment_for(user_id))
            .with_metric("samples", total as f64)
            .with_metric("categories_covered", covered as f64)
            .with_metric("majority_baseline", majority)
            .with_hyperparameter("epochs", epochs)
            .with_hyperparameter("learning_rate", learning_rate);
        result.model_name = Some(MODEL_NAME.to_string());
        if let Some(user) = user_id {
            result = result.with_tag("user_id", user);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimp_training::{write_archive, CalibrationSample, RunArgs, ScratchDirectory};
    use tempfile::TempDir;

    fn sample(label: &str, ts: &str) -> CalibrationSample {
        CalibrationSample {
            label: label.to_string(),
            blob: vec![1, 2, 3],
            timestamp: ts.to_string(),
        }
    }

    fn handle(name: &str, path: &Path) -> DatasetHandle {
        DatasetHandle {
            name: name.to_string(),
            source: format!("{name}/"),
            path: path.to_path_buf(),
            files: 0,
        }
    }

    fn calibration_datasets(path: &Path) -> BTreeMap<String, DatasetHandle> {
        BTreeMap::from([(CALIBRATION_DATASET.to_string(), handle(CALIBRATION_DATASET, path))])
    }

    async fn run_with(
        plugin: &EmotionRecognitionPlugin,
        args: &[(&str, &str)],
        datasets: BTreeMap<String, DatasetHandle>,
    ) -> (ScratchDirectory, PluginResult<RunResult>) {
        let scratch = ScratchDirectory::acquire(None, "test-run").unwrap();
        let args = RunArgs::new(
            args.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
        );
        let ctx = RunContext {
            run_id: "test-run",
            args: &args,
            datasets: &datasets,
            workspace: &scratch,
        };
        let result = plugin.run(&ctx).await;
        (scratch, result)
    }

    #[test]
    fn test_descriptor_is_valid_and_declares_categories() {
        let descriptor = EmotionRecognitionPlugin::default().describe();
        descriptor.validate().unwrap();
        assert_eq!(descriptor.categories.len(), 7);
        assert_eq!(descriptor.required_arguments().count(), 0);
        assert_eq!(descriptor.required_datasets().count(), 0);
    }

    #[test]
    fn test_experiment_naming() {
        assert_eq!(
            EmotionRecognitionPlugin::experiment_for(Some("bob")),
            "emotion_recognition_calib_bob"
        );
        assert_eq!(EmotionRecognitionPlugin::experiment_for(Some("  ")), "emotion_recognition");
        assert_eq!(EmotionRecognitionPlugin::experiment_for(None), "emotion_recognition");
    }

    #[tokio::test]
    async fn test_trains_from_calibration_archives() {
        let data = TempDir::new().unwrap();
        let archive = write_archive(
            "bob",
            &[
                sample("happy", "2024-05-01T12:00:00Z"),
                sample("happy", "2024-05-01T12:00:01Z"),
                sample("sad", "2024-05-01T12:00:02Z"),
            ],
        )
        .unwrap();
        std::fs::write(data.path().join("batch.tar.gz"), archive).unwrap();
        let other = write_archive("alice", &[sample("angry", "2024-05-01T12:00:03Z")]).unwrap();
        std::fs::write(data.path().join("other.tar.gz"), other).unwrap();

        let plugin = EmotionRecognitionPlugin::default();
        let datasets = calibration_datasets(data.path());
        let (scratch, result) =
            run_with(&plugin, &[("user_id", "bob"), ("epochs", "3")], datasets).await;
        let result = result.unwrap();

        assert_eq!(result.metrics["samples"], 3.0);
        assert_eq!(
            result.lineage(PLUGIN_NAME),
            ("emotion_recognition_calib_bob".to_string(), MODEL_NAME.to_string())
        );
        assert_eq!(result.hyperparameters["epochs"], "3");

        let model = result.model.unwrap();
        let bytes = std::fs::read(scratch.resolve(&model.path).unwrap()).unwrap();
        let written: EmotionPriorModel = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(written.counts["happy"], 2);
        assert!((written.priors["sad"] - 1.0 / 3.0).abs() < 1e-9);
        assert!(!written.counts.contains_key("angry"));
    }

    #[tokio::test]
    async fn test_counts_image_dataset() {
        let data = TempDir::new().unwrap();
        for (category, n) in [("fear", 2), ("neutral", 1), ("unknown", 5)] {
            let dir = data.path().join("train").join(category);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..n {
                std::fs::write(dir.join(format!("{i}.png")), b"img").unwrap();
            }
        }
        let plugin = EmotionRecognitionPlugin::default();
        let datasets =
            BTreeMap::from([(EMOTIONS_DATASET.to_string(), handle(EMOTIONS_DATASET, data.path()))]);
        let (_scratch, result) = run_with(&plugin, &[], datasets).await;
        let result = result.unwrap();
        assert_eq!(result.metrics["samples"], 3.0);
        assert_eq!(result.lineage(PLUGIN_NAME).0, PLUGIN_NAME);
    }

    #[tokio::test]
    async fn test_rejects_bad_inputs() {
        let plugin = EmotionRecognitionPlugin::default();
        let (_s, result) = run_with(&plugin, &[("epochs", "ten")], BTreeMap::new()).await;
        assert!(result.unwrap_err().cause.contains("epochs"));

        let (_s, result) = run_with(&plugin, &[("epochs", "0")], BTreeMap::new()).await;
        assert!(result.is_err());

        let (_s, result) = run_with(&plugin, &[], BTreeMap::new()).await;
        assert!(result.unwrap_err().cause.contains("no labelled samples"));
    }

    #[tokio::test]
    async fn test_rejects_labels_outside_category_set() {
        let data = TempDir::new().unwrap();
        let archive = write_archive("", &[sample("bored", "2024-05-01T12:00:00Z")]).unwrap();
        std::fs::write(data.path().join("batch.tar.gz"), archive).unwrap();

        let plugin = EmotionRecognitionPlugin::default();
        let (_s, result) = run_with(&plugin, &[], calibration_datasets(data.path())).await;
        assert!(result.unwrap_err().cause.contains("bored"));
    }
}
