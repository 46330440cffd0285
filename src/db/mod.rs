//! Durable, append-only log of sync runs.

pub mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::sync::status::{SyncState, SyncTrigger};

/// One orchestration run as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunEntry {
  pub id: i64,
  pub trigger_type: String,
  pub triggered_by: Option<String>,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub status: SyncState,
  pub items_synced: usize,
  pub items_failed: usize,
  pub error_code: Option<String>,
  pub error_message: Option<String>,
  /// Digest of the cached item set for successful runs
  pub fingerprint: Option<String>,
}

impl SyncRunEntry {
  pub fn duration_ms(&self) -> Option<i64> {
    self
      .finished_at
      .map(|end| (end - self.started_at).num_milliseconds())
  }
}

/// Final outcome written when a run ends.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
  pub status: SyncState,
  pub finished_at: DateTime<Utc>,
  pub items_synced: usize,
  pub items_failed: usize,
  pub error_code: Option<String>,
  pub error_message: Option<String>,
  pub fingerprint: Option<String>,
}

/// Storage for run-log entries.
pub trait RunLog: Send + Sync {
  /// Record a run in `syncing` state and return its id.
  fn start_run(&self, trigger: &SyncTrigger, started_at: DateTime<Utc>) -> Result<i64>;

  /// Complete a run. Fails if the run does not exist or was already completed.
  fn complete_run(&self, id: i64, completion: &RunCompletion) -> Result<()>;

  /// Newest runs first.
  fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunEntry>>;
}

/// Run-log that records nothing. Used when persistence is disabled.
pub struct NoopRunLog;

impl RunLog for NoopRunLog {
  fn start_run(&self, _trigger: &SyncTrigger, _started_at: DateTime<Utc>) -> Result<i64> {
    Ok(0)
  }

  fn complete_run(&self, _id: i64, _completion: &RunCompletion) -> Result<()> {
    Ok(())
  }

  fn recent_runs(&self, _limit: usize) -> Result<Vec<SyncRunEntry>> {
    Ok(Vec::new())
  }
}

/// SQLite-backed run-log.
pub struct SqliteRunLog {
  conn: Mutex<Connection>,
}

impl SqliteRunLog {
  /// Open or create the run-log at `path` (default location when `None`).
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let log = Self {
      conn: Mutex::new(conn),
    };
    log.run_migrations()?;
    log.close_interrupted_runs()?;
    Ok(log)
  }

  /// Get the default database path
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("issuesync").join("runs.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Runs left in `syncing` belong to a process that died mid-run.
  fn close_interrupted_runs(&self) -> Result<()> {
    let closed = self
      .conn()?
      .execute(
        "UPDATE sync_runs
         SET status = 'error', finished_at = ?, error_code = 'INTERRUPTED',
             error_message = 'process exited before the run completed'
         WHERE status = 'syncing'",
        params![Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to close interrupted runs: {}", e))?;

    if closed > 0 {
      warn!(runs = closed, "Marked interrupted sync runs as failed");
    }
    Ok(())
  }

  /// Fetch a single run by id.
  pub fn get_run(&self, id: i64) -> Result<Option<SyncRunEntry>> {
    let conn = self.conn()?;
    conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_RUNS),
        params![id],
        row_to_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load sync run {}: {}", id, e))
  }
}

const SELECT_RUNS: &str = "SELECT id, trigger_type, triggered_by, started_at, finished_at, status,
  items_synced, items_failed, error_code, error_message, fingerprint FROM sync_runs";

impl RunLog for SqliteRunLog {
  fn start_run(&self, trigger: &SyncTrigger, started_at: DateTime<Utc>) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO sync_runs (trigger_type, triggered_by, started_at, status)
         VALUES (?, ?, ?, 'syncing')",
        params![
          trigger.trigger_type.as_str(),
          trigger.actor,
          started_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to record sync run start: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  fn complete_run(&self, id: i64, completion: &RunCompletion) -> Result<()> {
    let updated = self
      .conn()?
      .execute(
        "UPDATE sync_runs
         SET status = ?, finished_at = ?, items_synced = ?, items_failed = ?,
             error_code = ?, error_message = ?, fingerprint = ?
         WHERE id = ? AND status = 'syncing'",
        params![
          completion.status.as_str(),
          completion.finished_at.to_rfc3339(),
          completion.items_synced as i64,
          completion.items_failed as i64,
          completion.error_code,
          completion.error_message,
          completion.fingerprint,
          id
        ],
      )
      .map_err(|e| eyre!("Failed to record sync run completion: {}", e))?;

    if updated == 0 {
      return Err(eyre!("Sync run {} is unknown or already completed", id));
    }
    Ok(())
  }

  fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!("{} ORDER BY id DESC LIMIT ?", SELECT_RUNS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let entries = stmt
      .query_map(params![limit as i64], row_to_entry)
      .map_err(|e| eyre!("Failed to query sync runs: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync runs: {}", e))?;

    Ok(entries)
  }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<SyncRunEntry> {
  let status: String = row.get(5)?;
  let started_at: String = row.get(3)?;
  let finished_at: Option<String> = row.get(4)?;
  let items_synced: i64 = row.get(6)?;
  let items_failed: i64 = row.get(7)?;

  Ok(SyncRunEntry {
    id: row.get(0)?,
    trigger_type: row.get(1)?,
    triggered_by: row.get(2)?,
    started_at: parse_datetime(&started_at).unwrap_or_default(),
    finished_at: finished_at.as_deref().and_then(parse_datetime),
    status: SyncState::parse(&status).unwrap_or(SyncState::Error),
    items_synced: items_synced.max(0) as usize,
    items_failed: items_failed.max(0) as usize,
    error_code: row.get(8)?,
    error_message: row.get(9)?,
    fingerprint: row.get(10)?,
  })
}

/// Parse an RFC 3339 timestamp as stored by this module.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
}
