//! SQLite experiment registry.
//!
//! Model versions live in `model_versions`; a partial unique index guarantees
//! at most one `production` row per experiment/model pair, and stage changes
//! run in an immediate transaction that demotes the previous holder first.

use async_trait::async_trait;
use chimp_orchestrator::{
    ExperimentRegistry, ExperimentRun, ModelStage, ModelVersion, NewModelVersion,
    OrchestrationError, StageChange,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use super::{
    format_timestamp, lock, parse_enum_field, parse_json_field, parse_timestamp, to_json,
    SharedDatabase, StorageResult,
};

const VERSION_COLUMNS: &str = "experiment_name, model_name, version, stage, artifact_uri, run_id, \
     hyperparameters, metrics, tags, created_at, updated_at";

fn row_to_version(row: &Row) -> rusqlite::Result<ModelVersion> {
    Ok(ModelVersion {
        experiment_name: row.get(0)?,
        model_name: row.get(1)?,
        version: row.get(2)?,
        stage: parse_enum_field(row, 3, "stage")?,
        artifact_uri: row.get(4)?,
        run_id: row.get(5)?,
        hyperparameters: parse_json_field(row, 6, "hyperparameters")?,
        metrics: parse_json_field(row, 7, "metrics")?,
        tags: parse_json_field(row, 8, "tags")?,
        created_at: parse_timestamp(row, 9, "created_at")?,
        updated_at: parse_timestamp(row, 10, "updated_at")?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<ExperimentRun> {
    Ok(ExperimentRun {
        experiment_name: row.get(0)?,
        run_id: row.get(1)?,
        plugin_name: row.get(2)?,
        metrics: parse_json_field(row, 3, "metrics")?,
        hyperparameters: parse_json_field(row, 4, "hyperparameters")?,
        tags: parse_json_field(row, 5, "tags")?,
        recorded_at: parse_timestamp(row, 6, "recorded_at")?,
    })
}

fn load_version(
    conn: &Connection,
    experiment_name: &str,
    model_name: &str,
    version: u32,
) -> StorageResult<Option<ModelVersion>> {
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM model_versions \
         WHERE experiment_name = ?1 AND model_name = ?2 AND version = ?3"
    );
    Ok(conn
        .query_row(&sql, params![experiment_name, model_name, version], row_to_version)
        .optional()?)
}

fn load_production(
    conn: &Connection,
    experiment_name: &str,
    model_name: &str,
) -> StorageResult<Option<ModelVersion>> {
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM model_versions \
         WHERE experiment_name = ?1 AND model_name = ?2 AND stage = ?3"
    );
    let stage = ModelStage::Production.as_str();
    Ok(conn
        .query_row(&sql, params![experiment_name, model_name, stage], row_to_version)
        .optional()?)
}

fn set_stage(
    conn: &Connection,
    version: &ModelVersion,
    stage: ModelStage,
    updated_at: &str,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE model_versions SET stage = ?1, updated_at = ?2 \
         WHERE experiment_name = ?3 AND model_name = ?4 AND version = ?5",
        params![
            stage.as_str(),
            updated_at,
            version.experiment_name,
            version.model_name,
            version.version
        ],
    )?;
    Ok(())
}

/// Outcome of the transactional part of a stage change.
enum Transition {
    Done(StageChange),
    NotFound,
    Rejected(ModelStage),
}

/// Experiment registry persisted in `experiment_runs` and `model_versions`.
#[derive(Debug, Clone)]
pub struct SqliteExperimentRegistry {
    db: SharedDatabase,
}

impl SqliteExperimentRegistry {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn record_run_sync(&self, run: &ExperimentRun) -> StorageResult<()> {
        let db = lock(&self.db)?;
        db.conn().execute(
            "INSERT OR REPLACE INTO experiment_runs \
             (experiment_name, run_id, plugin_name, metrics, hyperparameters, tags, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.experiment_name,
                run.run_id,
                run.plugin_name,
                to_json(&run.metrics)?,
                to_json(&run.hyperparameters)?,
                to_json(&run.tags)?,
                format_timestamp(run.recorded_at),
            ],
        )?;
        Ok(())
    }

    fn list_runs_sync(&self, experiment_name: &str) -> StorageResult<Vec<ExperimentRun>> {
        let db = lock(&self.db)?;
        let mut stmt = db.conn().prepare(
            "SELECT experiment_name, run_id, plugin_name, metrics, hyperparameters, tags, \
             recorded_at FROM experiment_runs WHERE experiment_name = ?1 ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![experiment_name], row_to_run)?;
        let mut runs = Vec::new();
        for run in rows {
            runs.push(run?);
        }
        Ok(runs)
    }

    fn create_version_sync(&self, new: NewModelVersion) -> StorageResult<ModelVersion> {
        let mut db = lock(&self.db)?;
        let tx = db.conn_mut().transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM model_versions \
             WHERE experiment_name = ?1 AND model_name = ?2 AND run_id = ?3"
        );
        let key = params![new.experiment_name, new.model_name, new.run_id];
        let existing = tx.query_row(&sql, key, row_to_version).optional()?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let latest: Option<u32> = tx.query_row(
            "SELECT MAX(version) FROM model_versions \
             WHERE experiment_name = ?1 AND model_name = ?2",
            params![new.experiment_name, new.model_name],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        let version = ModelVersion {
            experiment_name: new.experiment_name,
            model_name: new.model_name,
            version: latest.unwrap_or(0) + 1,
            stage: ModelStage::None,
            artifact_uri: new.artifact_uri,
            run_id: new.run_id,
            hyperparameters: new.hyperparameters,
            metrics: new.metrics,
            tags: new.tags,
            created_at: now,
            updated_at: now,
        };
        let sql = format!(
            "INSERT INTO model_versions ({VERSION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        );
        tx.execute(
            &sql,
            params![
                version.experiment_name,
                version.model_name,
                version.version,
                version.stage.as_str(),
                version.artifact_uri,
                version.run_id,
                to_json(&version.hyperparameters)?,
                to_json(&version.metrics)?,
                to_json(&version.tags)?,
                format_timestamp(version.created_at),
                format_timestamp(version.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(version)
    }

    fn query_versions(
        &self,
        filter: &str,
        experiment_name: &str,
        model_name: &str,
        stage: Option<ModelStage>,
    ) -> StorageResult<Vec<ModelVersion>> {
        let db = lock(&self.db)?;
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM model_versions \
             WHERE experiment_name = ?1 AND model_name = ?2 {filter} ORDER BY version"
        );
        let mut stmt = db.conn().prepare(&sql)?;
        let rows = match stage {
            Some(stage) => stmt.query_map(
                params![experiment_name, model_name, stage.as_str()],
                row_to_version,
            )?,
            None => stmt.query_map(params![experiment_name, model_name], row_to_version)?,
        };
        let mut versions = Vec::new();
        for version in rows {
            versions.push(version?);
        }
        Ok(versions)
    }

    fn transition_sync(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
        expected: ModelStage,
        target: ModelStage,
    ) -> StorageResult<Transition> {
        let mut db = lock(&self.db)?;
        let tx = db.conn_mut().transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut current) = load_version(&tx, experiment_name, model_name, version)? else {
            return Ok(Transition::NotFound);
        };
        let previous_stage = current.stage;
        if previous_stage != expected || !previous_stage.can_transition_to(target) {
            return Ok(Transition::Rejected(previous_stage));
        }

        let now = Utc::now();
        let stamp = format_timestamp(now);
        let mut demoted = None;
        if target == ModelStage::Production && previous_stage != ModelStage::Production {
            if let Some(mut holder) = load_production(&tx, experiment_name, model_name)? {
                set_stage(&tx, &holder, ModelStage::Staging, &stamp)?;
                holder.stage = ModelStage::Staging;
                holder.updated_at = now;
                demoted = Some(holder);
            }
        }
        if previous_stage != target {
            set_stage(&tx, &current, target, &stamp)?;
            current.stage = target;
            current.updated_at = now;
        }
        tx.commit()?;
        Ok(Transition::Done(StageChange { previous_stage, version: current, demoted }))
    }
}

#[async_trait]
impl ExperimentRegistry for SqliteExperimentRegistry {
    async fn record_run(&self, run: &ExperimentRun) -> chimp_orchestrator::Result<()> {
        Ok(self.record_run_sync(run)?)
    }

    async fn list_runs(
        &self,
        experiment_name: &str,
    ) -> chimp_orchestrator::Result<Vec<ExperimentRun>> {
        Ok(self.list_runs_sync(experiment_name)?)
    }

    async fn create_model_version(
        &self,
        new: NewModelVersion,
    ) -> chimp_orchestrator::Result<ModelVersion> {
        let version = self.create_version_sync(new)?;
        info!(
            experiment = %version.experiment_name,
            model = %version.model_name,
            version = version.version,
            run_id = %version.run_id,
            "Model version registered"
        );
        Ok(version)
    }

    async fn get_version(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
    ) -> chimp_orchestrator::Result<Option<ModelVersion>> {
        let db = lock(&self.db)?;
        Ok(load_version(db.conn(), experiment_name, model_name, version)?)
    }

    async fn list_versions(
        &self,
        experiment_name: &str,
        model_name: &str,
    ) -> chimp_orchestrator::Result<Vec<ModelVersion>> {
        Ok(self.query_versions("", experiment_name, model_name, None)?)
    }

    async fn latest_in_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        stage: ModelStage,
    ) -> chimp_orchestrator::Result<Option<ModelVersion>> {
        let versions =
            self.query_versions("AND stage = ?3", experiment_name, model_name, Some(stage))?;
        Ok(versions.into_iter().last())
    }

    async fn transition_stage(
        &self,
        experiment_name: &str,
        model_name: &str,
        version: u32,
        expected: ModelStage,
        target: ModelStage,
    ) -> chimp_orchestrator::Result<StageChange> {
        match self.transition_sync(experiment_name, model_name, version, expected, target)? {
            Transition::Done(change) => Ok(change),
            Transition::NotFound => Err(OrchestrationError::ModelNotFound {
                experiment: experiment_name.to_string(),
                model: model_name.to_string(),
                version,
            }),
            Transition::Rejected(from) => {
                Err(OrchestrationError::InvalidStageTransition { from, to: target })
            }
        }
    }
}
