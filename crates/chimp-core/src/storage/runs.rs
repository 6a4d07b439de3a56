//! SQLite run store.
//!
//! Every status change loads the row, applies the same transition helpers the
//! in-memory store uses and writes it back inside one `BEGIN IMMEDIATE`
//! transaction, so a claim is a compare-and-set even across processes.

use std::time::Duration;

use async_trait::async_trait;
use chimp_orchestrator::run::{lease_deadline, try_claim};
use chimp_orchestrator::{ClaimOutcome, RunCompletion, RunStatus, RunStore, TrainingRun};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{
    format_timestamp, lock, parse_enum_field, parse_json_field, parse_optional_timestamp,
    parse_timestamp, to_json, SharedDatabase, StorageError, StorageResult,
};

const RUN_COLUMNS: &str = "run_id, plugin_name, submitted_args, dataset_refs, status, \
     result_model_uri, metrics, hyperparameters, tags, experiment_name, model_version, \
     attempts, worker_id, lease_expires_at, error, created_at, updated_at";

fn row_to_run(row: &Row) -> rusqlite::Result<TrainingRun> {
    Ok(TrainingRun {
        run_id: row.get(0)?,
        plugin_name: row.get(1)?,
        submitted_args: parse_json_field(row, 2, "submitted_args")?,
        dataset_refs: parse_json_field(row, 3, "dataset_refs")?,
        status: parse_enum_field(row, 4, "status")?,
        result_model_uri: row.get(5)?,
        metrics: parse_json_field(row, 6, "metrics")?,
        hyperparameters: parse_json_field(row, 7, "hyperparameters")?,
        tags: parse_json_field(row, 8, "tags")?,
        experiment_name: row.get(9)?,
        model_version: row.get(10)?,
        attempts: row.get(11)?,
        worker_id: row.get(12)?,
        lease_expires_at: parse_optional_timestamp(row, 13, "lease_expires_at")?,
        error: row.get(14)?,
        created_at: parse_timestamp(row, 15, "created_at")?,
        updated_at: parse_timestamp(row, 16, "updated_at")?,
    })
}

fn load_run(conn: &Connection, run_id: &str) -> StorageResult<Option<TrainingRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM training_runs WHERE run_id = ?1");
    Ok(conn.query_row(&sql, params![run_id], row_to_run).optional()?)
}

/// Inserts the run, or overwrites every column of an existing row.
fn save_run(conn: &Connection, run: &TrainingRun, replace: bool) -> StorageResult<()> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = format!(
        "{verb} INTO training_runs ({RUN_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
    );
    conn.execute(
        &sql,
        params![
            run.run_id,
            run.plugin_name,
            to_json(&run.submitted_args)?,
            to_json(&run.dataset_refs)?,
            run.status.as_str(),
            run.result_model_uri,
            to_json(&run.metrics)?,
            to_json(&run.hyperparameters)?,
            to_json(&run.tags)?,
            run.experiment_name,
            run.model_version,
            run.attempts,
            run.worker_id,
            run.lease_expires_at.map(format_timestamp),
            run.error,
            format_timestamp(run.created_at),
            format_timestamp(run.updated_at),
        ],
    )?;
    Ok(())
}

/// Run store persisted in the `training_runs` table.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    db: SharedDatabase,
}

impl SqliteRunStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn claim_sync(
        &self,
        run_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> StorageResult<ClaimOutcome> {
        let mut db = lock(&self.db)?;
        let tx = db.conn_mut().transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut run) = load_run(&tx, run_id)? else {
            return Ok(ClaimOutcome::NotFound);
        };
        let outcome = try_claim(&mut run, worker_id, lease, Utc::now());
        if matches!(outcome, ClaimOutcome::Claimed(_)) {
            save_run(&tx, &run, true)?;
            tx.commit()?;
        }
        Ok(outcome)
    }

    /// Applies `update` if `worker_id` still holds the run.
    fn update_held(
        &self,
        run_id: &str,
        worker_id: &str,
        update: impl FnOnce(&mut TrainingRun),
    ) -> StorageResult<bool> {
        let mut db = lock(&self.db)?;
        let tx = db.conn_mut().transaction_with_behavior(TransactionBehavior::Immediate)?;
        match load_run(&tx, run_id)? {
            Some(mut run) if run.is_held_by(worker_id) => {
                update(&mut run);
                save_run(&tx, &run, true)?;
                tx.commit()?;
                Ok(true)
            }
            _ => {
                debug!(
                    run_id = %run_id,
                    worker_id = %worker_id,
                    "Run no longer held, update skipped"
                );
                Ok(false)
            }
        }
    }

    fn list_sync(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> StorageResult<Vec<TrainingRun>> {
        let db = lock(&self.db)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut runs = Vec::new();
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs WHERE status = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                );
                let mut stmt = db.conn().prepare(&sql)?;
                let rows = stmt.query_map(params![status.as_str(), limit], row_to_run)?;
                for run in rows {
                    runs.push(run?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs ORDER BY created_at DESC LIMIT ?1"
                );
                let mut stmt = db.conn().prepare(&sql)?;
                let rows = stmt.query_map(params![limit], row_to_run)?;
                for run in rows {
                    runs.push(run?);
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn insert(&self, run: &TrainingRun) -> chimp_orchestrator::Result<()> {
        let db = lock(&self.db)?;
        save_run(db.conn(), run, false)?;
        Ok(())
    }

    async fn get(&self, run_id: &str) -> chimp_orchestrator::Result<Option<TrainingRun>> {
        let db = lock(&self.db)?;
        Ok(load_run(db.conn(), run_id)?)
    }

    async fn list(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> chimp_orchestrator::Result<Vec<TrainingRun>> {
        Ok(self.list_sync(status, limit)?)
    }

    async fn claim(
        &self,
        run_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> chimp_orchestrator::Result<ClaimOutcome> {
        Ok(self.claim_sync(run_id, worker_id, lease)?)
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> chimp_orchestrator::Result<bool> {
        let now = Utc::now();
        Ok(self.update_held(run_id, worker_id, |run| {
            run.lease_expires_at = Some(lease_deadline(now, lease));
            run.updated_at = now;
        })?)
    }

    async fn complete(
        &self,
        run_id: &str,
        worker_id: &str,
        completion: &RunCompletion,
    ) -> chimp_orchestrator::Result<bool> {
        Ok(self.update_held(run_id, worker_id, |run| run.mark_succeeded(completion, Utc::now()))?)
    }

    async fn fail(
        &self,
        run_id: &str,
        worker_id: &str,
        cause: &str,
    ) -> chimp_orchestrator::Result<bool> {
        Ok(self.update_held(run_id, worker_id, |run| run.mark_failed(cause, Utc::now()))?)
    }

    async fn requeue(
        &self,
        run_id: &str,
        worker_id: &str,
        cause: &str,
    ) -> chimp_orchestrator::Result<bool> {
        Ok(self.update_held(run_id, worker_id, |run| run.mark_requeued(cause, Utc::now()))?)
    }

    async fn withdraw(&self, run_id: &str) -> chimp_orchestrator::Result<bool> {
        let db = lock(&self.db)?;
        let deleted = db
            .conn()
            .execute(
                "DELETE FROM training_runs WHERE run_id = ?1 AND status = ?2",
                params![run_id, RunStatus::Queued.as_str()],
            )
            .map_err(StorageError::from)?;
        Ok(deleted == 1)
    }
}
