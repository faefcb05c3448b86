//! Filesystem store for large binary payload content.
//!
//! Queue entries keep a [`BlobRef`](crate::entry::BlobRef) instead of inline
//! bytes; the bytes live here under a generated name. All operations are
//! idempotent: deleting a missing blob is not an error.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};

/// Byte-blob storage addressable by a generated path string.
pub struct BlobStore {
  root: PathBuf,
}

impl BlobStore {
  /// Open (or create) the blob directory under the given data dir.
  pub fn open(data_dir: &Path) -> Result<Self> {
    let root = data_dir.join("blobs");
    std::fs::create_dir_all(&root)
      .map_err(|e| eyre!("Failed to create blob directory {}: {}", root.display(), e))?;
    Ok(Self { root })
  }

  /// Store bytes under a freshly generated name; returns the blob path.
  pub fn put(&self, bytes: &[u8]) -> Result<String> {
    let name = format!("{}.bin", uuid::Uuid::new_v4());
    let path = self.root.join(&name);
    std::fs::write(&path, bytes)
      .map_err(|e| eyre!("Failed to write blob {}: {}", path.display(), e))?;
    Ok(name)
  }

  /// Read a blob back; `None` if it no longer exists.
  pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
    let path = self.resolve(name)?;
    match std::fs::read(&path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read blob {}: {}", path.display(), e)),
    }
  }

  /// Delete a blob; missing blobs are ignored.
  pub fn delete(&self, name: &str) -> Result<()> {
    let path = self.resolve(name)?;
    match std::fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!("Failed to delete blob {}: {}", path.display(), e)),
    }
  }

  /// Delete every stored blob.
  pub fn clear(&self) -> Result<()> {
    let entries = std::fs::read_dir(&self.root)
      .map_err(|e| eyre!("Failed to list blob directory: {}", e))?;
    for entry in entries.flatten() {
      let path = entry.path();
      if path.is_file() {
        std::fs::remove_file(&path)
          .map_err(|e| eyre!("Failed to delete blob {}: {}", path.display(), e))?;
      }
    }
    Ok(())
  }

  /// Names are generated uuids; anything path-like is rejected.
  fn resolve(&self, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
      return Err(eyre!("Invalid blob name '{}'", name));
    }
    Ok(self.root.join(name))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_put_read_delete_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();

    let name = store.put(b"image bytes").unwrap();
    assert_eq!(store.read(&name).unwrap().unwrap(), b"image bytes");

    store.delete(&name).unwrap();
    assert!(store.read(&name).unwrap().is_none());
  }

  #[test]
  fn test_delete_missing_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();
    assert!(store.delete("no-such-blob.bin").is_ok());
  }

  #[test]
  fn test_path_like_names_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();
    assert!(store.read("../escape.bin").is_err());
    assert!(store.delete("a/b.bin").is_err());
  }

  #[test]
  fn test_clear_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();
    let a = store.put(b"a").unwrap();
    let b = store.put(b"b").unwrap();

    store.clear().unwrap();
    assert!(store.read(&a).unwrap().is_none());
    assert!(store.read(&b).unwrap().is_none());
  }
}
