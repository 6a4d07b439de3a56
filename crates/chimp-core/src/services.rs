//! Service assembly.
//!
//! Turns a [`ChimpConfig`] into the wired-up orchestrator: stores, plugin
//! registry, dispatcher, promotion workflow, calibration coordinator and
//! production model resolver. The HTTP server, the worker-only mode and the
//! CLI's local commands all start from here.

use std::sync::Arc;

use chimp_orchestrator::{
    CalibrationCoordinator, JobDispatcher, LoadReport, PluginRegistry, PromotionWorkflow, Stores,
    WorkerPool,
};
use chimp_training::TrainingPlugin;
use tracing::info;

use crate::artifacts::FsArtifactStore;
use crate::config::{ChimpConfig, StorageBackend, StorageConfig};
use crate::error::Result;
use crate::plugins::builtin_plugins;
use crate::serving::ProductionModelResolver;
use crate::storage::{
    shared, Database, SqliteExperimentRegistry, SqliteRunStore, SqliteWorkQueue,
};

/// Opens the stores selected by `storage`.
///
/// # Errors
/// Returns an error if the database or the artifact root cannot be opened.
pub fn open_stores(storage: &StorageConfig) -> Result<Stores> {
    match storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory stores");
            Ok(Stores::in_memory())
        }
        StorageBackend::Sqlite => {
            let db = shared(Database::open(&storage.database_path)?);
            let artifacts = FsArtifactStore::open(&storage.artifact_root)?;
            info!(
                database = %storage.database_path.display(),
                artifacts = %artifacts.root().display(),
                "Using SQLite and filesystem stores"
            );
            Ok(Stores {
                runs: Arc::new(SqliteRunStore::new(Arc::clone(&db))),
                queue: Arc::new(SqliteWorkQueue::new(Arc::clone(&db))),
                artifacts: Arc::new(artifacts),
                experiments: Arc::new(SqliteExperimentRegistry::new(db)),
            })
        }
    }
}

/// Everything a CHIMP process needs, built once at startup.
pub struct ChimpServices {
    pub config: ChimpConfig,
    pub stores: Stores,
    pub dispatcher: Arc<JobDispatcher>,
    pub promotion: Arc<PromotionWorkflow>,
    pub calibration: Arc<CalibrationCoordinator>,
    pub resolver: Arc<ProductionModelResolver>,
    pub load_report: LoadReport,
}

impl std::fmt::Debug for ChimpServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChimpServices")
            .field("config", &self.config)
            .field("load_report", &self.load_report)
            .finish_non_exhaustive()
    }
}

impl ChimpServices {
    /// Opens the configured stores and loads the built-in plugins.
    ///
    /// # Errors
    /// Returns an error if a store cannot be opened.
    pub fn from_config(config: ChimpConfig) -> Result<Self> {
        let stores = open_stores(&config.storage)?;
        let plugins = builtin_plugins(&config.calibration.category_set());
        Ok(Self::assemble(config, stores, plugins))
    }

    /// Wires services over explicit stores and plugins.
    pub fn assemble(
        config: ChimpConfig,
        stores: Stores,
        plugins: Vec<Arc<dyn TrainingPlugin>>,
    ) -> Self {
        let mut registry = PluginRegistry::new();
        let load_report = registry.load(plugins);

        let calibration = CalibrationCoordinator::for_plugin(
            Arc::clone(&stores.artifacts),
            &registry,
            &config.calibration.plugin,
            config.calibration.category_set(),
        );
        let dispatcher = JobDispatcher::new(
            Arc::new(registry),
            stores.clone(),
            config.dispatcher.dispatcher_config(config.storage.scratch_root.clone()),
        );

        Self {
            promotion: Arc::new(PromotionWorkflow::new(Arc::clone(&stores.experiments))),
            resolver: Arc::new(ProductionModelResolver::new(
                Arc::clone(&stores.experiments),
                Arc::clone(&stores.runs),
            )),
            calibration: Arc::new(calibration),
            dispatcher: Arc::new(dispatcher),
            stores,
            load_report,
            config,
        }
    }

    /// A worker pool over this process's dispatcher; not started.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(Arc::clone(&self.dispatcher), self.config.dispatcher.pool_config())
    }
}
