//! Database connection and schema management.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::storage::error::StorageResult;

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper.
///
/// Manages the SQLite connection and schema initialization. Several processes
/// may open the same file; every multi-statement write runs in an immediate
/// transaction so they serialize on SQLite's write lock.
pub struct Database {
    conn: Connection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.conn.path()).finish()
    }
}

impl Database {
    /// Opens a database file, creating it and its schema if needed.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database connection fails
    /// * `StorageError::Io` - If the parent directory cannot be created
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        info!(path = %path.display(), journal_mode = %mode, "Opened database");
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Opens an in-memory database for testing.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database connection fails
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Gets a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Gets a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Initializes the database schema.
    ///
    /// Creates the tables for training runs, the work queue, experiment runs
    /// and model versions.
    fn init_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS training_runs (
                run_id TEXT PRIMARY KEY,
                plugin_name TEXT NOT NULL,
                submitted_args TEXT NOT NULL,
                dataset_refs TEXT NOT NULL,
                status TEXT NOT NULL,
                result_model_uri TEXT,
                metrics TEXT NOT NULL,
                hyperparameters TEXT NOT NULL,
                tags TEXT NOT NULL,
                experiment_name TEXT,
                model_version INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                lease_expires_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_training_runs_status
                ON training_runs(status, created_at);

            CREATE TABLE IF NOT EXISTS work_queue (
                delivery_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                available_at INTEGER NOT NULL,
                leased_by TEXT,
                deliveries INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_queue_available
                ON work_queue(available_at, delivery_id);

            CREATE TABLE IF NOT EXISTS experiment_runs (
                experiment_name TEXT NOT NULL,
                run_id TEXT NOT NULL,
                plugin_name TEXT NOT NULL,
                metrics TEXT NOT NULL,
                hyperparameters TEXT NOT NULL,
                tags TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (experiment_name, run_id)
            );

            CREATE TABLE IF NOT EXISTS model_versions (
                experiment_name TEXT NOT NULL,
                model_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                stage TEXT NOT NULL,
                artifact_uri TEXT NOT NULL,
                run_id TEXT NOT NULL,
                hyperparameters TEXT NOT NULL,
                metrics TEXT NOT NULL,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (experiment_name, model_name, version),
                UNIQUE (experiment_name, model_name, run_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_versions_single_production
                ON model_versions(experiment_name, model_name)
                WHERE stage = 'production';
            "#,
        )?;

        info!("Database schema initialized successfully");
        Ok(())
    }
}
