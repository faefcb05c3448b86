//! Last-known-good cache for GET responses.
//!
//! Keyed by a sha256 of the request path plus canonicalized query
//! parameters. There is no expiry: the freshest successful response wins
//! and stays until overwritten. This is an offline fallback, not a TTL
//! cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// A cached successful GET response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Value,
  pub fetched_at: DateTime<Utc>,
}

/// SQLite-backed response cache; its own database file so corruption here
/// never touches the queue or the log buffer.
pub struct ResponseCache {
  conn: Mutex<Connection>,
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_key TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);
"#;

impl ResponseCache {
  /// Open (or create) the cache database under the given data dir.
  /// An unreadable file is discarded and recreated empty.
  pub fn open(data_dir: &Path) -> Result<Self> {
    let path = data_dir.join("cache.db");

    let conn = match Self::open_conn(&path) {
      Ok(conn) => conn,
      Err(e) => {
        warn!(
          path = %path.display(),
          error = %e,
          "Response cache unreadable; starting empty (data loss)"
        );
        std::fs::remove_file(&path)
          .map_err(|e| eyre!("Failed to discard corrupt response cache: {}", e))?;
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
      .map_err(|e| eyre!("Failed to open response cache at {}: {}", path.display(), e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(conn)
  }

  /// Overwrite the cached response for `(path, query)`.
  pub fn put(
    &self,
    path: &str,
    query: &[(String, String)],
    response: &CachedResponse,
  ) -> Result<()> {
    let key = cache_key(path, query);
    let data =
      serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (cache_key, path, data, fetched_at)
         VALUES (?, ?, ?, ?)",
        params![key, path, data, response.fetched_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store cached response: {}", e))?;

    Ok(())
  }

  /// Look up the cached response for `(path, query)`, if any.
  pub fn get(&self, path: &str, query: &[(String, String)]) -> Result<Option<CachedResponse>> {
    let key = cache_key(path, query);

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM response_cache WHERE cache_key = ?",
        params![key],
        |row| row.get(0),
      )
      .ok();

    match data {
      Some(data) => match serde_json::from_slice(&data) {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
          warn!(path, error = %e, "Discarding unreadable cached response");
          conn
            .execute(
              "DELETE FROM response_cache WHERE cache_key = ?",
              params![key],
            )
            .map_err(|e| eyre!("Failed to discard cached response: {}", e))?;
          Ok(None)
        }
      },
      None => Ok(None),
    }
  }

  /// Drop every cached response.
  pub fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(|e| eyre!("Failed to clear response cache: {}", e))?;
    Ok(())
  }
}

/// Stable, fixed-length cache key: sha256 over the path and the query
/// parameters in sorted order, so parameter order never splits the cache.
fn cache_key(path: &str, query: &[(String, String)]) -> String {
  let mut sorted: Vec<&(String, String)> = query.iter().collect();
  sorted.sort();

  let mut hasher = Sha256::new();
  hasher.update(path.as_bytes());
  for (k, v) in sorted {
    hasher.update(b"&");
    hasher.update(k.as_bytes());
    hasher.update(b"=");
    hasher.update(v.as_bytes());
  }
  hex::encode(hasher.finalize())
}
