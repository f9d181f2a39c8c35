//! Store root: layout, metadata, and the advisory write lock
//!
//! The store directory is the whole world: objects, snapshots, batches, and
//! derived indexes all live under one root. `store.json` marks an initialized
//! root and carries the layout schema version.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   store.json
//!   store.lock                  (advisory, writers only)
//!   objects/sha256/aa/bb/<hex>
//!   snapshots/<id>/{snapshot.json, files.index.jsonl}
//!   batches/<id>/...
//!   indexes/lmdb/
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cas::ObjectStore;
use crate::error::{Result, StoreError};
use crate::fsio;

pub const STORE_SCHEMA_NAME: &str = "codebatch.store";
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// `store.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_name: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

/// Handle to an initialized store root
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    cas: ObjectStore,
}

impl Store {
    /// Initialize a new store root. Fails if one already exists there.
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta_path = root.join("store.json");
        if meta_path.exists() {
            return Err(StoreError::store_invalid(format!(
                "store already initialized at {}",
                root.display()
            )));
        }
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("snapshots"))?;
        fs::create_dir_all(root.join("batches"))?;
        fs::create_dir_all(root.join("indexes"))?;
        let cas = ObjectStore::open(&root)?;

        let meta = StoreMeta {
            schema_name: STORE_SCHEMA_NAME.to_string(),
            schema_version: STORE_SCHEMA_VERSION,
            created_at: Utc::now(),
        };
        fsio::write_json_atomic(&meta_path, &meta)?;
        info!(root = %root.display(), "store initialized");
        Ok(Self { root, cas })
    }

    /// Open an existing store root.
    ///
    /// # Errors
    ///
    /// - `ErrorKind::StoreNotFound` when `store.json` is absent
    /// - `ErrorKind::StoreInvalid` when it does not parse or names a foreign
    ///   schema
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta_path = root.join("store.json");
        if !meta_path.exists() {
            return Err(StoreError::store_not_found(root.display()));
        }
        let meta: StoreMeta = fsio::read_json(&meta_path)
            .map_err(|e| StoreError::store_invalid(format!("bad store.json: {}", e)))?;
        if meta.schema_name != STORE_SCHEMA_NAME {
            return Err(StoreError::store_invalid(format!(
                "unexpected schema {:?} in store.json",
                meta.schema_name
            )));
        }
        let cas = ObjectStore::open(&root)?;
        Ok(Self { root, cas })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cas(&self) -> &ObjectStore {
        &self.cas
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id)
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.root.join("batches")
    }

    pub fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.batches_dir().join(batch_id)
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    pub fn lmdb_dir(&self) -> PathBuf {
        self.indexes_dir().join("lmdb")
    }

    /// Take the advisory writer lock. Held for the life of the returned
    /// guard; a second writer gets `ErrorKind::Locked` instead of corrupting
    /// peer state.
    pub fn lock_exclusive(&self) -> Result<StoreLock> {
        let path = self.root.join("store.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            StoreError::locked(format!(
                "another process is writing to {}",
                self.root.display()
            ))
        })?;
        Ok(StoreLock { file })
    }
}

/// RAII guard for the store writer lock
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_init_then_open() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("s");
        Store::init(&root).unwrap();
        let store = Store::open(&root).unwrap();
        assert!(store.root().join("store.json").exists());
        assert!(store.snapshots_dir().exists());
        assert!(store.batches_dir().exists());
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("s");
        Store::init(&root).unwrap();
        let err = Store::init(&root).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreInvalid);
    }

    #[test]
    fn test_open_missing_store() {
        let dir = TempDir::new().unwrap();
        let err = Store::open(dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreNotFound);
    }

    #[test]
    fn test_open_invalid_store_json() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("s");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("store.json"), b"not json").unwrap();
        let err = Store::open(&root).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreInvalid);
    }

    #[test]
    fn test_writer_lock_excludes_second_writer() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("s");
        let store = Store::init(&root).unwrap();
        let _guard = store.lock_exclusive().unwrap();
        let err = store.lock_exclusive().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Locked);
    }
}
