use crate::artifacts::ModelArtifact;
use crate::dataset::DatasetHandle;
use crate::descriptor::PluginDescriptor;
use crate::error::{PluginExecutionError, PluginResult};
use crate::scratch::ScratchDirectory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// String-keyed arguments submitted for a run.
///
/// Values are untyped on purpose: each plugin parses what it needs and fails
/// with a `PluginExecutionError` when an input is malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunArgs(BTreeMap<String, String>);

impl RunArgs {
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> PluginResult<&str> {
        self.get(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PluginExecutionError::new(format!("missing required argument '{name}'")))
    }

    /// Parse an optional argument, falling back to `default` when absent.
    pub fn parse_or<T>(&self, name: &str, default: T) -> PluginResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                let message = format!("argument '{name}' has invalid value '{raw}': {e}");
                PluginExecutionError::new(message)
            }),
        }
    }

    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for RunArgs {
    fn from(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }
}

/// Everything a plugin receives for one run.
#[derive(Debug)]
pub struct RunContext<'a> {
    pub run_id: &'a str,
    pub args: &'a RunArgs,
    pub datasets: &'a BTreeMap<String, DatasetHandle>,
    pub workspace: &'a ScratchDirectory,
}

impl RunContext<'_> {
    pub fn dataset(&self, name: &str) -> PluginResult<&DatasetHandle> {
        self.datasets
            .get(name)
            .ok_or_else(|| PluginExecutionError::new(format!("dataset '{name}' was not provided")))
    }
}

/// What a successful run reports back. Every field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub model: Option<ModelArtifact>,
    /// Experiment to record the run under. Defaults to the plugin name.
    #[serde(default)]
    pub experiment_name: Option<String>,
    /// Registered model name. Defaults to the experiment name.
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Extra files to upload next to the model, keyed by artifact name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
}

impl RunResult {
    #[must_use]
    pub fn with_model(mut self, model: ModelArtifact) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn with_experiment(mut self, experiment_name: impl Into<String>) -> Self {
        self.experiment_name = Some(experiment_name.into());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_hyperparameter(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.hyperparameters.insert(name.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Resolve the experiment and model names for a run of `plugin_name`.
    #[must_use]
    pub fn lineage(&self, plugin_name: &str) -> (String, String) {
        let experiment = self
            .experiment_name
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| plugin_name.to_string());
        let model = self
            .model_name
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| experiment.clone());
        (experiment, model)
    }
}

/// A training procedure the orchestrator can run without knowing its internals.
#[async_trait]
pub trait TrainingPlugin: Send + Sync {
    /// Pure self-description; callable before any run.
    fn describe(&self) -> PluginDescriptor;

    /// Execute one run. Blocks the calling worker for the whole training
    /// duration; the dispatcher provides the asynchrony.
    async fn run(&self, ctx: &RunContext<'_>) -> PluginResult<RunResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> RunArgs {
        RunArgs::new(pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect())
    }

    #[test]
    fn test_require_rejects_missing_and_blank() {
        let a = args(&[("user_id", "  ")]);
        assert!(a.require("user_id").is_err());
        assert!(a.require("epochs").is_err());
    }

    #[test]
    fn test_parse_or_reports_typed_error() {
        let a = args(&[("epochs", "ten")]);
        let err = a.parse_or::<u32>("epochs", 1).unwrap_err();
        assert!(err.cause.contains("epochs"));
        assert_eq!(a.parse_or::<u32>("batch_size", 8).unwrap(), 8);
        assert_eq!(args(&[("epochs", " 3 ")]).parse_or::<u32>("epochs", 1).unwrap(), 3);
    }

    #[test]
    fn test_lineage_defaults() {
        let result = RunResult::default();
        assert_eq!(
            result.lineage("emotion_recognition"),
            ("emotion_recognition".into(), "emotion_recognition".into())
        );

        let result = RunResult::default().with_experiment("OnnxEmotionModel");
        assert_eq!(result.lineage("p"), ("OnnxEmotionModel".into(), "OnnxEmotionModel".into()));

        let mut result = RunResult::default().with_experiment("exp");
        result.model_name = Some("model".into());
        assert_eq!(result.lineage("p"), ("exp".into(), "model".into()));
    }
}
