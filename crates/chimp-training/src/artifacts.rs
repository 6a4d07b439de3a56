use crate::descriptor::ModelType;
use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    Auxiliary,
}

/// The model a plugin produced, still on the local scratch filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Path inside the run's scratch directory (relative or absolute).
    pub path: PathBuf,
    pub model_type: ModelType,
}

impl ModelArtifact {
    pub fn new(path: impl Into<PathBuf>, model_type: ModelType) -> Self {
        Self { path: path.into(), model_type }
    }
}

/// One object the dispatcher uploaded on behalf of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub kind: ArtifactKind,
    pub key: String,
    pub uri: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Written next to a run's artifacts so the upload can be audited later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub plugin_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, String>,
    pub artifacts: Vec<StoredArtifact>,
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read a local artifact file, failing with a descriptive error when missing.
pub fn read_artifact(path: &Path) -> TrainingResult<Vec<u8>> {
    if !path.is_file() {
        return Err(TrainingError::Artifact(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }
    Ok(std::fs::read(path)?)
}

/// Store key under which a run's artifact is uploaded.
#[must_use]
pub fn run_artifact_key(run_id: &str, file_name: &str) -> String {
    format!("runs/{run_id}/{file_name}")
}
