//! Content-addressed object store
//!
//! Write-once blob store keyed by SHA-256. Blobs live at
//! `objects/sha256/<aa>/<bb>/<hex>` under the store root, where `aa` and `bb`
//! are the first two hex-byte pairs of the digest. Writes stream to a
//! temporary sibling, fsync, then rename; `put` on an existing object is a
//! no-op, so concurrent writers are benign.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, StoreError};

/// SHA-256 object identity (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    /// Compute the hash of a byte slice
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 64 {
            return Err(StoreError::invalid_path(format!(
                "object hash must be 64 hex chars, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk)
                .map_err(|_| StoreError::invalid_path("non-UTF-8 hash"))?;
            bytes[i] = u8::from_str_radix(s, 16)
                .map_err(|_| StoreError::invalid_path(format!("bad hex digit in {hex:?}")))?;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Persisted form is the lowercase hex string.
impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ObjectHash::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Content-addressed object store rooted at `<store>/objects`
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects_dir: PathBuf,
}

impl ObjectStore {
    /// Open the object store under a store root. Creates `objects/sha256`.
    pub fn open(store_root: &Path) -> Result<Self> {
        let objects_dir = store_root.join("objects").join("sha256");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    /// Final path for an object hash: `objects/sha256/aa/bb/<hex>`
    pub fn path_of(&self, hash: &ObjectHash) -> PathBuf {
        let hex = hash.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..4]).join(&hex)
    }

    /// Whether the object is present
    pub fn has(&self, hash: &ObjectHash) -> bool {
        self.path_of(hash).exists()
    }

    /// Store bytes, returning their hash. Idempotent: an existing object is
    /// left untouched.
    pub fn put(&self, bytes: &[u8]) -> Result<ObjectHash> {
        let hash = ObjectHash::compute(bytes);
        let path = self.path_of(&hash);

        if path.exists() {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path(&path);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        match fs::rename(&tmp, &path) {
            Ok(()) => {}
            Err(e) => {
                // Lost a race with a concurrent writer: the winner's bytes
                // are identical by content addressing.
                let _ = fs::remove_file(&tmp);
                if !path.exists() {
                    return Err(e.into());
                }
            }
        }

        debug!(hash = %hash, size = bytes.len(), "object stored");
        Ok(hash)
    }

    /// Read an object back, verifying its digest.
    ///
    /// # Errors
    ///
    /// - `ErrorKind::Io` with `NotFound` source when the object is missing
    /// - `ErrorKind::CasCorrupt` when stored bytes do not hash to `hash`
    pub fn get(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        let path = self.path_of(hash);
        let mut bytes = Vec::new();
        File::open(&path)
            .map_err(|e| {
                StoreError::io(format!("object {} not readable", hash)).with_source(e)
            })?
            .read_to_end(&mut bytes)?;

        let actual = ObjectHash::compute(&bytes);
        if actual != *hash {
            return Err(StoreError::cas_corrupt(&hash.to_hex(), &actual.to_hex()));
        }
        Ok(bytes)
    }

    /// Hash a file's contents and store them, streaming in chunks.
    pub fn put_file(&self, path: &Path) -> Result<(ObjectHash, u64)> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let size = bytes.len() as u64;
        let hash = self.put(&bytes)?;
        Ok((hash, size))
    }

    fn tmp_path(&self, final_path: &Path) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut name = final_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".tmp.{}.{}", std::process::id(), n));
        final_path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let cas = ObjectStore::open(dir.path()).unwrap();
        (dir, cas)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, cas) = store();
        let hash = cas.put(b"hello world").unwrap();
        assert!(cas.has(&hash));
        assert_eq!(cas.get(&hash).unwrap(), b"hello world");
    }

    #[test]
    fn test_put_idempotent() {
        let (_dir, cas) = store();
        let h1 = cas.put(b"same bytes").unwrap();
        let h2 = cas.put(b"same bytes").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_empty_object() {
        let (_dir, cas) = store();
        let hash = cas.put(b"").unwrap();
        // SHA-256 of the empty string
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(cas.get(&hash).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_path_layout() {
        let (dir, cas) = store();
        let hash = cas.put(b"layout").unwrap();
        let hex = hash.to_hex();
        let expected = dir
            .path()
            .join("objects")
            .join("sha256")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex);
        assert_eq!(cas.path_of(&hash), expected);
        assert!(expected.exists());
    }

    #[test]
    fn test_get_detects_corruption() {
        let (_dir, cas) = store();
        let hash = cas.put(b"pristine").unwrap();
        std::fs::write(cas.path_of(&hash), b"tampered").unwrap();
        let err = cas.get(&hash).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::CasCorrupt);
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = ObjectHash::compute(b"roundtrip");
        let hex = hash.to_hex();
        assert_eq!(ObjectHash::from_hex(&hex).unwrap(), hash);
        assert!(ObjectHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_hash_serde() {
        let hash = ObjectHash::compute(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ObjectHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
