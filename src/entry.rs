//! Queue entry types and enqueue-time validation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Payload key whose value is captured as the client version marker
/// and replayed as the `X-Client-Version` header.
pub const VERSION_FIELD: &str = "updatedAt";

/// Payload string values larger than this are extracted to the blob store.
pub const INLINE_LIMIT: usize = 32 * 1024;

/// Mutating operation kind, mapped to HTTP verb semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
  Create,
  Update,
  Patch,
  Delete,
}

impl Operation {
  /// HTTP method used when replaying this operation.
  pub fn method(&self) -> &'static str {
    match self {
      Operation::Create => "POST",
      Operation::Update => "PUT",
      Operation::Patch => "PATCH",
      Operation::Delete => "DELETE",
    }
  }
}

/// Reference to binary content held in the external blob store.
///
/// `field` is the payload key the bytes were extracted from, so replay
/// can put them back before sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
  pub path: String,
  pub field: String,
}

/// A pending mutating operation before it has been persisted.
///
/// Validated at enqueue time: each operation kind has an expected payload
/// shape, checked here instead of trusted blindly at replay time.
#[derive(Debug, Clone)]
pub struct EntryDraft {
  pub operation: Operation,
  pub target_path: String,
  pub payload: Map<String, Value>,
  pub headers: BTreeMap<String, String>,
  pub blob: Option<BlobRef>,
}

impl EntryDraft {
  pub fn new(operation: Operation, target_path: impl Into<String>) -> Self {
    Self {
      operation,
      target_path: target_path.into(),
      payload: Map::new(),
      headers: BTreeMap::new(),
      blob: None,
    }
  }

  pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
    self.payload = payload;
    self
  }

  pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
    self.headers = headers;
    self
  }

  /// Check the draft against the per-operation payload rules.
  pub fn validate(&self) -> Result<()> {
    if !self.target_path.starts_with('/') {
      return Err(eyre!(
        "Target path must be absolute, got '{}'",
        self.target_path
      ));
    }

    match self.operation {
      Operation::Create | Operation::Update | Operation::Patch => {
        if self.payload.is_empty() && self.blob.is_none() {
          return Err(eyre!(
            "{} to {} has an empty payload",
            self.operation.method(),
            self.target_path
          ));
        }
      }
      Operation::Delete => {
        if !self.payload.is_empty() {
          return Err(eyre!(
            "DELETE to {} must not carry a payload",
            self.target_path
          ));
        }
      }
    }

    Ok(())
  }
}

/// One durably persisted pending operation awaiting replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
  /// Unique id, generated at enqueue time.
  pub id: String,
  pub operation: Operation,
  pub target_path: String,
  /// Remaining inline payload (large binary fields are extracted).
  pub payload: Map<String, Value>,
  /// Extra request headers to replay.
  pub headers: BTreeMap<String, String>,
  /// External blob reference, if a binary field was extracted.
  pub blob: Option<BlobRef>,
  /// Version marker captured from the payload at enqueue time.
  pub client_version: Option<String>,
  /// Enqueue timestamp; defines replay order.
  pub created_at: DateTime<Utc>,
  /// Failed replay attempts so far. Only ever increases for a given id.
  pub retry_count: u32,
}

impl QueueEntry {
  /// Turn a validated draft into a fresh entry with a generated id,
  /// the current timestamp, and a zero retry count.
  pub fn from_draft(draft: EntryDraft) -> Result<Self> {
    draft.validate()?;

    let client_version = client_version_of(&draft.payload);

    Ok(Self {
      id: uuid::Uuid::new_v4().to_string(),
      operation: draft.operation,
      target_path: draft.target_path,
      payload: draft.payload,
      headers: draft.headers,
      blob: draft.blob,
      client_version,
      created_at: Utc::now(),
      retry_count: 0,
    })
  }
}

/// Extract the client version marker from a payload, if present.
pub fn client_version_of(payload: &Map<String, Value>) -> Option<String> {
  match payload.get(VERSION_FIELD) {
    Some(Value::String(s)) => Some(s.clone()),
    Some(Value::Number(n)) => Some(n.to_string()),
    _ => None,
  }
}
