use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of model artifact a plugin produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Sklearn,
    Onnx,
    Tensorflow,
    Pytorch,
    Other,
}

impl ModelType {
    /// Parse a free-form tag. Unknown tags map to `Other`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sklearn" => Self::Sklearn,
            "onnx" => Self::Onnx,
            "tensorflow" => Self::Tensorflow,
            "pytorch" => Self::Pytorch,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sklearn => "sklearn",
            Self::Onnx => "onnx",
            Self::Tensorflow => "tensorflow",
            Self::Pytorch => "pytorch",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyword argument a plugin accepts.
///
/// `type` is a hint for callers only; plugins parse their own inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_hint: String,
    pub description: String,
    #[serde(default)]
    pub optional: bool,
}

impl ArgumentSpec {
    pub fn required(
        name: impl Into<String>,
        type_hint: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            type_hint: type_hint.into(),
            description: description.into(),
            optional: false,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        type_hint: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self { optional: true, ..Self::required(name, type_hint, description) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub optional: bool,
}

impl DatasetSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), optional: false }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { optional: true, ..Self::required(name, description) }
    }
}

/// Self-description of a training plugin.
///
/// `name` is the only key used to locate and invoke the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgumentSpec>,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetSpec>,
    #[serde(default)]
    pub model_return_type: Option<ModelType>,
    /// Labels the plugin expects on calibration samples. Empty when the plugin
    /// does not consume labelled data.
    #[serde(default)]
    pub categories: Vec<String>,
}

impl PluginDescriptor {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            arguments: BTreeMap::new(),
            datasets: BTreeMap::new(),
            model_return_type: None,
            categories: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_argument(mut self, spec: ArgumentSpec) -> Self {
        self.arguments.insert(spec.name.clone(), spec);
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, spec: DatasetSpec) -> Self {
        self.datasets.insert(spec.name.clone(), spec);
        self
    }

    #[must_use]
    pub fn with_model_return_type(mut self, model_type: ModelType) -> Self {
        self.model_return_type = Some(model_type);
        self
    }

    #[must_use]
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn required_arguments(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.arguments.values().filter(|a| !a.optional)
    }

    pub fn required_datasets(&self) -> impl Iterator<Item = &DatasetSpec> {
        self.datasets.values().filter(|d| !d.optional)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.name.trim().is_empty() {
            return Err(TrainingError::InvalidDescriptor("name is required".to_string()));
        }
        for (key, arg) in &self.arguments {
            if key != &arg.name {
                return Err(TrainingError::InvalidDescriptor(format!(
                    "argument key '{key}' does not match spec name '{}'",
                    arg.name
                )));
            }
        }
        for (key, ds) in &self.datasets {
            if key != &ds.name {
                return Err(TrainingError::InvalidDescriptor(format!(
                    "dataset key '{key}' does not match spec name '{}'",
                    ds.name
                )));
            }
        }
        if self.categories.iter().any(|c| c.trim().is_empty()) {
            return Err(TrainingError::InvalidDescriptor(
                "categories must not contain blank labels".to_string(),
            ));
        }
        Ok(())
    }
}
