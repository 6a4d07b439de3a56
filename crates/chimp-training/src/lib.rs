//! CHIMP Training
//!
//! Backend-agnostic plugin contract for training runs:
//! - Describing plugins (`PluginDescriptor`, `ArgumentSpec`, `DatasetSpec`)
//! - Implementing plugins (`TrainingPlugin`, `RunContext`, `RunResult`)
//! - Per-run scratch directories and model artifacts
//! - The calibration archive format shared by ingestion and plugins

pub mod artifacts;
pub mod calibration;
pub mod dataset;
pub mod descriptor;
pub mod error;
pub mod plugin;
pub mod scratch;

pub use artifacts::{
    read_artifact, run_artifact_key, sha256_bytes, ArtifactKind, ModelArtifact, RunManifest,
    StoredArtifact,
};
pub use calibration::{
    read_archive, sanitize_timestamp, write_archive, CalibrationSample, CategorySet,
    DEFAULT_CATEGORIES,
};
pub use dataset::{normalize_prefix, DatasetHandle};
pub use descriptor::{ArgumentSpec, DatasetSpec, ModelType, PluginDescriptor};
pub use error::{PluginExecutionError, PluginResult, TrainingError, TrainingResult};
pub use plugin::{RunArgs, RunContext, RunResult, TrainingPlugin};
pub use scratch::ScratchDirectory;
