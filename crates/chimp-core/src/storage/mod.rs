//! Storage layer for CHIMP Core.
//!
//! SQLite implementations of the orchestrator's run store, work queue and
//! experiment registry. All three can share one [`Database`]; separate
//! processes can open the same file and coordinate through SQLite's locking.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod experiments;
pub mod queue;
pub mod runs;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use experiments::SqliteExperimentRegistry;
pub use queue::SqliteWorkQueue;
pub use runs::SqliteRunStore;

/// A database handle shared by the SQLite stores of one process.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Wraps a database for sharing between stores.
pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

fn lock(db: &SharedDatabase) -> StorageResult<MutexGuard<'_, Database>> {
    db.lock().map_err(|e| StorageError::InvalidData(format!("Database lock error: {}", e)))
}

/// Fixed-width RFC3339 so stored timestamps sort lexically.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn invalid_column(idx: usize, column_name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
}

/// Parses a JSON field from a row into a deserializable type.
///
/// # Errors
/// Returns a `rusqlite::Error::InvalidColumnType` if parsing fails.
fn parse_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| invalid_column(idx, column_name))
}

/// Parses an RFC3339 timestamp string from a row into a `DateTime<Utc>`.
///
/// # Errors
/// Returns a `rusqlite::Error::InvalidColumnType` if parsing fails.
fn parse_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, column_name))
}

fn parse_optional_timestamp(
    row: &Row,
    idx: usize,
    column_name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let timestamp_str: Option<String> = row.get(idx)?;
    timestamp_str
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| invalid_column(idx, column_name))
        })
        .transpose()
}

/// Parses a `FromStr` enum column such as a run status or model stage.
fn parse_enum_field<T: std::str::FromStr>(
    row: &Row,
    idx: usize,
    column_name: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|_| invalid_column(idx, column_name))
}
