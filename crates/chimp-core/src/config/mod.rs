//! Configuration module for CHIMP Core.
//!
//! Settings are layered: built-in defaults, then an optional `chimp.toml`, then
//! `CHIMP__<SECTION>__<KEY>` environment variables (for example
//! `CHIMP__DISPATCHER__WORKERS=4`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chimp_orchestrator::{DispatcherConfig, WorkerPoolConfig};
use chimp_training::{CategorySet, DEFAULT_CATEGORIES};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// File read by [`ChimpConfig::load`] when present.
pub const DEFAULT_CONFIG_FILE: &str = "chimp.toml";

/// Prefix of the environment variables layered over the file.
pub const ENV_PREFIX: &str = "CHIMP";

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to bind the HTTP API to.
    pub address: SocketAddr,
    /// Run the worker pool inside the server process.
    pub run_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: SocketAddr::from(([127, 0, 0, 1], 5253)), run_workers: true }
    }
}

/// Which store implementations to wire up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite metadata plus filesystem artifacts.
    #[default]
    Sqlite,
    /// Everything in process memory; lost on exit.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite file holding runs, the work queue and the experiment registry.
    pub database_path: PathBuf,
    /// Root directory of the filesystem artifact store.
    pub artifact_root: PathBuf,
    /// Parent directory for per-run scratch directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: PathBuf::from("chimp.db"),
            artifact_root: PathBuf::from("artifacts"),
            scratch_root: None,
        }
    }
}

/// Dispatcher and worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub workers: usize,
    pub worker_prefix: String,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_prefix: "worker".to_string(),
            poll_interval_ms: 500,
            lease_secs: 60,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl DispatcherSection {
    #[must_use]
    pub fn dispatcher_config(&self, scratch_root: Option<PathBuf>) -> DispatcherConfig {
        DispatcherConfig {
            lease_duration: Duration::from_secs(self.lease_secs.max(1)),
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            scratch_root,
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            worker_prefix: self.worker_prefix.clone(),
        }
    }
}

/// Calibration ingestion configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Plugin whose declared categories validate uploads, and the default
    /// plugin trained by `flush?train=`.
    pub plugin: String,
    /// Labels accepted when the plugin declares none.
    pub categories: Vec<String>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            plugin: "emotion_recognition".to_string(),
            categories: DEFAULT_CATEGORIES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl CalibrationConfig {
    #[must_use]
    pub fn category_set(&self) -> CategorySet {
        if self.categories.is_empty() {
            CategorySet::default()
        } else {
            CategorySet::new(self.categories.iter())
        }
    }
}

/// Root configuration for CHIMP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChimpConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub dispatcher: DispatcherSection,
    pub calibration: CalibrationConfig,
}

impl ChimpConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `chimp.toml` (if present) and the process environment over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_layered(Some(Path::new(DEFAULT_CONFIG_FILE)), None)
    }

    /// Load from an explicit file over the defaults, then the process environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_layered(Some(path), None)
    }

    /// Builds the layered configuration.
    ///
    /// `env` replaces the process environment as the source of `CHIMP__*`
    /// variables when given.
    pub fn load_layered(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(false));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("calibration.categories")
            .source(env);
        let config = builder.add_source(environment).build()?.try_deserialize()?;
        Ok(config)
    }
}
