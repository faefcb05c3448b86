//! Durable queue store: persists pending operations across restarts.
//!
//! Entries are stored as serialized JSON rows in their own SQLite file
//! (`queue.db`), with `created_at` and `retry_count` mirrored into columns
//! for status queries. The store owns the blob lifecycle: removing an entry
//! also removes the blob its payload references.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::blobs::BlobStore;
use crate::entry::{EntryDraft, QueueEntry};

/// Snapshot of queue health for UI badges and operator visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
  /// Entries awaiting replay (including stuck ones).
  pub pending: u64,
  /// Entries at or over the retry cap.
  pub stuck: u64,
  /// Enqueue time of the oldest pending entry.
  pub oldest_created_at: Option<DateTime<Utc>>,
}

/// Storage backend for the pending-operation queue.
pub trait QueueStorage: Send + Sync {
  /// Persist a new entry built from the draft; returns the stored entry
  /// with its generated id, timestamp, and zero retry count.
  fn append(&self, draft: EntryDraft) -> Result<QueueEntry>;

  /// All entries, in storage order. Callers sort by `created_at` before
  /// replay; no ordering is guaranteed here.
  fn list(&self) -> Result<Vec<QueueEntry>>;

  /// Look up a single entry by id.
  fn get(&self, id: &str) -> Result<Option<QueueEntry>>;

  /// Overwrite an existing entry (used to persist retry counts).
  fn update(&self, entry: &QueueEntry) -> Result<()>;

  /// Delete an entry and the blob it references, if any.
  fn remove(&self, id: &str) -> Result<()>;

  /// Delete all entries and all blobs. Explicit user reset only.
  fn clear(&self) -> Result<()>;

  /// Number of entries awaiting replay.
  fn pending_count(&self) -> Result<u64>;

  /// Entries whose retry count has reached the cap.
  fn stuck(&self, cap: u32) -> Result<Vec<QueueEntry>>;

  /// Queue health snapshot.
  fn status(&self, cap: u32) -> Result<QueueStatus>;
}

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
  blobs: Arc<BlobStore>,
}

/// Schema for the queue namespace. Kept in its own database file so
/// corruption here cannot affect the response cache or the log buffer.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_created
    ON queue_entries(created_at);
"#;

impl SqliteQueueStore {
  /// Open (or create) the queue database under the given data dir.
  ///
  /// If the existing file is unreadable it is discarded and recreated
  /// empty. That favors availability over perfect durability and is
  /// logged as a data-loss event.
  pub fn open(data_dir: &Path, blobs: Arc<BlobStore>) -> Result<Self> {
    let path = data_dir.join("queue.db");

    let conn = match Self::open_conn(&path) {
      Ok(conn) => conn,
      Err(e) => {
        warn!(
          path = %path.display(),
          error = %e,
          "Queue store unreadable; discarding persisted queue (data loss)"
        );
        std::fs::remove_file(&path)
          .map_err(|e| eyre!("Failed to discard corrupt queue store: {}", e))?;
        Self::open_conn(&path)?
      }
    };

    Ok(Self {
      conn: Mutex::new(conn),
      blobs,
    })
  }

  fn open_conn(path: &PathBuf) -> Result<Connection> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue store at {}: {}", path.display(), e))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(conn)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStorage for SqliteQueueStore {
  fn append(&self, draft: EntryDraft) -> Result<QueueEntry> {
    let entry = QueueEntry::from_draft(draft)?;
    let data =
      serde_json::to_vec(&entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO queue_entries (id, created_at, retry_count, data) VALUES (?, ?, ?, ?)",
        params![entry.id, entry.created_at.to_rfc3339(), entry.retry_count, data],
      )
      .map_err(|e| eyre!("Failed to append queue entry: {}", e))?;

    Ok(entry)
  }

  fn list(&self) -> Result<Vec<QueueEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT id, data FROM queue_entries")
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to read queue entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    drop(stmt);

    let mut entries = Vec::with_capacity(rows.len());
    for (id, data) in rows {
      match serde_json::from_slice::<QueueEntry>(&data) {
        Ok(entry) => entries.push(entry),
        Err(e) => {
          // Unreadable row: retrying cannot help, drop it.
          warn!(id = %id, error = %e, "Discarding unreadable queue entry (data loss)");
          conn
            .execute("DELETE FROM queue_entries WHERE id = ?", params![id])
            .map_err(|e| eyre!("Failed to discard unreadable entry: {}", e))?;
        }
      }
    }

    Ok(entries)
  }

  fn get(&self, id: &str) -> Result<Option<QueueEntry>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM queue_entries WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .ok();

    match data {
      Some(data) => {
        let entry = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entry {}: {}", id, e))?;
        Ok(Some(entry))
      }
      None => Ok(None),
    }
  }

  fn update(&self, entry: &QueueEntry) -> Result<()> {
    let data =
      serde_json::to_vec(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE queue_entries SET retry_count = ?, data = ? WHERE id = ?",
        params![entry.retry_count, data, entry.id],
      )
      .map_err(|e| eyre!("Failed to update queue entry: {}", e))?;

    if changed == 0 {
      return Err(eyre!("No queue entry with id {}", entry.id));
    }
    Ok(())
  }

  fn remove(&self, id: &str) -> Result<()> {
    let blob = {
      let conn = self.lock()?;

      let data: Option<Vec<u8>> = conn
        .query_row(
          "SELECT data FROM queue_entries WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .ok();

      conn
        .execute("DELETE FROM queue_entries WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove queue entry: {}", e))?;

      data
        .and_then(|d| serde_json::from_slice::<QueueEntry>(&d).ok())
        .and_then(|e| e.blob)
    };

    // The entry owns its blob: the row is gone, so the bytes go too.
    if let Some(blob) = blob {
      self.blobs.delete(&blob.path)?;
    }

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    {
      let conn = self.lock()?;
      conn
        .execute("DELETE FROM queue_entries", [])
        .map_err(|e| eyre!("Failed to clear queue: {}", e))?;
    }
    self.blobs.clear()
  }

  fn pending_count(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue entries: {}", e))?;
    Ok(count as u64)
  }

  fn stuck(&self, cap: u32) -> Result<Vec<QueueEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT data FROM queue_entries WHERE retry_count >= ?")
      .map_err(|e| eyre!("Failed to prepare stuck query: {}", e))?;

    let entries = stmt
      .query_map(params![cap], |row| {
        let data: Vec<u8> = row.get(0)?;
        Ok(data)
      })
      .map_err(|e| eyre!("Failed to read stuck entries: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(entries)
  }

  fn status(&self, cap: u32) -> Result<QueueStatus> {
    let conn = self.lock()?;

    let (pending, stuck, oldest): (i64, i64, Option<String>) = conn
      .query_row(
        "SELECT COUNT(*),
                COUNT(*) FILTER (WHERE retry_count >= ?),
                MIN(created_at)
         FROM queue_entries",
        params![cap],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| eyre!("Failed to read queue status: {}", e))?;

    let oldest_created_at = oldest
      .as_deref()
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|dt| dt.with_timezone(&Utc));

    Ok(QueueStatus {
      pending: pending as u64,
      stuck: stuck as u64,
      oldest_created_at,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entry::Operation;
  use serde_json::json;

  fn open_store(dir: &Path) -> SqliteQueueStore {
    let blobs = Arc::new(BlobStore::open(dir).unwrap());
    SqliteQueueStore::open(dir, blobs).unwrap()
  }

  fn draft(path: &str) -> EntryDraft {
    let mut payload = serde_json::Map::new();
    payload.insert("status".into(), json!("DONE"));
    EntryDraft::new(Operation::Update, path).with_payload(payload)
  }

  #[test]
  fn test_append_list_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let entry = store.append(draft("/jobs/1")).unwrap();
    assert_eq!(entry.retry_count, 0);

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, entry.id);
    assert_eq!(listed[0].target_path, "/jobs/1");
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
      let store = open_store(dir.path());
      store.append(draft("/jobs/1")).unwrap().id
    };

    let store = open_store(dir.path());
    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
  }

  #[test]
  fn test_update_persists_retry_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut entry = store.append(draft("/jobs/1")).unwrap();
    entry.retry_count += 1;
    store.update(&entry).unwrap();

    let listed = store.list().unwrap();
    assert_eq!(listed[0].retry_count, 1);
  }

  #[test]
  fn test_update_unknown_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut entry = store.append(draft("/jobs/1")).unwrap();
    store.remove(&entry.id).unwrap();
    entry.retry_count = 1;
    assert!(store.update(&entry).is_err());
  }

  #[test]
  fn test_remove_deletes_owned_blob() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BlobStore::open(dir.path()).unwrap());
    let store = SqliteQueueStore::open(dir.path(), Arc::clone(&blobs)).unwrap();

    let blob_path = blobs.put(b"photo bytes").unwrap();
    let mut d = draft("/messages");
    d.operation = Operation::Create;
    d.blob = Some(crate::entry::BlobRef {
      path: blob_path.clone(),
      field: "photo".into(),
    });

    let entry = store.append(d).unwrap();
    assert!(blobs.read(&blob_path).unwrap().is_some());

    store.remove(&entry.id).unwrap();
    assert!(blobs.read(&blob_path).unwrap().is_none());
    assert_eq!(store.pending_count().unwrap(), 0);
  }

  #[test]
  fn test_clear_removes_entries_and_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BlobStore::open(dir.path()).unwrap());
    let store = SqliteQueueStore::open(dir.path(), Arc::clone(&blobs)).unwrap();

    let blob_path = blobs.put(b"bytes").unwrap();
    store.append(draft("/jobs/1")).unwrap();
    store.append(draft("/jobs/2")).unwrap();

    store.clear().unwrap();
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(blobs.read(&blob_path).unwrap().is_none());
  }

  #[test]
  fn test_unreadable_row_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    store.append(draft("/jobs/1")).unwrap();

    // Corrupt a second row behind the store's back.
    let raw = Connection::open(dir.path().join("queue.db")).unwrap();
    raw
      .execute(
        "INSERT INTO queue_entries (id, created_at, retry_count, data) VALUES (?, ?, 0, ?)",
        params!["bad", Utc::now().to_rfc3339(), b"not json".to_vec()],
      )
      .unwrap();
    drop(raw);

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    // The bad row is gone for good.
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_corrupt_database_self_heals() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("queue.db"), b"this is not sqlite").unwrap();

    let store = open_store(dir.path());
    assert_eq!(store.pending_count().unwrap(), 0);
    store.append(draft("/jobs/1")).unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_stuck_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let fresh = store.append(draft("/jobs/1")).unwrap();
    let mut worn = store.append(draft("/jobs/2")).unwrap();
    worn.retry_count = 3;
    store.update(&worn).unwrap();

    let stuck = store.stuck(3).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, worn.id);

    let status = store.status(3).unwrap();
    assert_eq!(status.pending, 2);
    assert_eq!(status.stuck, 1);
    assert_eq!(status.oldest_created_at, Some(fresh.created_at));
  }
}
