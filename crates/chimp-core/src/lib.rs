//! CHIMP Core
//!
//! Service assembly for the CHIMP training service: configuration, SQLite and
//! filesystem backends for the orchestrator's stores, the built-in training
//! plugins, the production model resolver and the HTTP API.

pub mod artifacts;
pub mod config;
pub mod datasets;
pub mod error;
pub mod plugins;
pub mod server;
pub mod serving;
pub mod services;
pub mod storage;

pub use artifacts::FsArtifactStore;
pub use config::{
    CalibrationConfig, ChimpConfig, DispatcherSection, ServerConfig, StorageBackend, StorageConfig,
};
pub use error::{ChimpError, Result};
pub use plugins::{builtin_plugins, EmotionRecognitionPlugin, ExamplePlugin};
pub use server::{router, AppState};
pub use serving::{calibrated_experiment, Calibration, ProductionModelResolver, ResolvedModel};
pub use services::{open_stores, ChimpServices};
pub use storage::{
    Database, SqliteExperimentRegistry, SqliteRunStore, SqliteWorkQueue, StorageError,
    StorageResult,
};
