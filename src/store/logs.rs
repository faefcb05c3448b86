//! Durable buffer for diagnostic log records.
//!
//! Records accumulate in their own SQLite file (`logs.db`) until the log
//! batcher ships them; deletion happens only through the acknowledged
//! high-water mark, so a failed flush leaves the buffer intact.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
  Audit,
}

/// One diagnostic record destined for the backend's batch log endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
  pub level: LogLevel,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub context: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
  pub platform: String,
  pub created_at: DateTime<Utc>,
}

impl LogRecord {
  pub fn new(level: LogLevel, message: impl Into<String>, platform: impl Into<String>) -> Self {
    Self {
      level,
      message: message.into(),
      context: None,
      stack: None,
      platform: platform.into(),
      created_at: Utc::now(),
    }
  }

  pub fn with_context(mut self, context: Value) -> Self {
    self.context = Some(context);
    self
  }

  pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
    self.stack = Some(stack.into());
    self
  }
}

/// SQLite-backed log buffer.
pub struct LogStore {
  conn: Mutex<Connection>,
}

const LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS log_buffer (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    data BLOB NOT NULL
);
"#;

impl LogStore {
  /// Open (or create) the log buffer under the given data dir.
  /// An unreadable file is discarded and recreated empty.
  pub fn open(data_dir: &Path) -> Result<Self> {
    let path = data_dir.join("logs.db");

    let conn = match Self::open_conn(&path) {
      Ok(conn) => conn,
      Err(e) => {
        warn!(
          path = %path.display(),
          error = %e,
          "Log buffer unreadable; starting empty (data loss)"
        );
        std::fs::remove_file(&path)
          .map_err(|e| eyre!("Failed to discard corrupt log buffer: {}", e))?;
        Self::open_conn(&path)?
      }
    };

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn open_conn(path: &PathBuf) -> Result<Connection> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open log buffer at {}: {}", path.display(), e))?;

    conn
      .execute_batch(LOG_SCHEMA)
      .map_err(|e| eyre!("Failed to run log buffer migrations: {}", e))?;

    Ok(conn)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Append a record to the buffer.
  pub fn append(&self, record: &LogRecord) -> Result<()> {
    let data =
      serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize log record: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute("INSERT INTO log_buffer (data) VALUES (?)", params![data])
      .map_err(|e| eyre!("Failed to buffer log record: {}", e))?;
    Ok(())
  }

  /// The whole current buffer in insertion order, with the sequence number
  /// of the newest record (the flush high-water mark).
  pub fn snapshot(&self) -> Result<Option<(Vec<LogRecord>, i64)>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT seq, data FROM log_buffer ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare log query: {}", e))?;

    let rows: Vec<(i64, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to read log buffer: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    drop(stmt);

    let mut high_water = None;
    let mut records = Vec::with_capacity(rows.len());
    for (seq, data) in rows {
      match serde_json::from_slice(&data) {
        Ok(record) => {
          records.push(record);
          high_water = Some(seq);
        }
        Err(e) => {
          warn!(seq, error = %e, "Skipping unreadable log record");
          high_water = Some(seq);
        }
      }
    }

    match high_water {
      Some(seq) if !records.is_empty() => Ok(Some((records, seq))),
      // Only unreadable rows left: clear them out.
      Some(seq) => {
        conn
          .execute("DELETE FROM log_buffer WHERE seq <= ?", params![seq])
          .map_err(|e| eyre!("Failed to drop unreadable log records: {}", e))?;
        Ok(None)
      }
      None => Ok(None),
    }
  }

  /// Delete every record up to and including the acknowledged mark.
  pub fn delete_through(&self, high_water: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM log_buffer WHERE seq <= ?", params![high_water])
      .map_err(|e| eyre!("Failed to trim log buffer: {}", e))?;
    Ok(())
  }

  /// Number of buffered records.
  pub fn pending_count(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM log_buffer", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count log buffer: {}", e))?;
    Ok(count as u64)
  }
}
