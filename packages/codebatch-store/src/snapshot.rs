//! Snapshot builder
//!
//! Ingests a source tree into an immutable manifest: every file's bytes land
//! in the object store, every path is canonicalized, and the per-file index
//! is written in canonical order. The `snapshot_id` is a content hash over
//! the stable projection of the file index, so snapshotting the same bytes
//! twice yields the same id.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use ignore::overrides::{Override, OverrideBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cas::ObjectHash;
use crate::error::{Result, StoreError};
use crate::fsio;
use crate::paths::{self, CanonicalPath};
use crate::store::Store;

pub const FILE_SCHEMA_NAME: &str = "codebatch.file";
pub const FILE_SCHEMA_VERSION: u32 = 1;
pub const SNAPSHOT_SCHEMA_NAME: &str = "codebatch.snapshot";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// One row of `files.index.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub schema_name: String,
    pub schema_version: u32,
    pub path: String,
    pub path_key: String,
    pub object: ObjectHash,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_hash: Option<ObjectHash>,
}

/// `snapshot.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub schema_name: String,
    pub schema_version: u32,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Walk options for [`build_snapshot`]
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Include globs; empty means everything
    pub include: Vec<String>,
    /// Exclude globs
    pub exclude: Vec<String>,
    /// Follow symlinks (loops are rejected)
    pub follow_symlinks: bool,
}

/// Build an immutable snapshot of `dir` inside the store.
///
/// Walks the tree, canonicalizes every relative path, stores file bytes in
/// the CAS, then writes `files.index.jsonl` (canonical order) and
/// `snapshot.json`. Re-running over unchanged input produces the same
/// `snapshot_id` and byte-identical index.
///
/// # Errors
///
/// - `ErrorKind::PathCollision` when two paths normalize to one `path_key`
/// - `ErrorKind::SymlinkLoop` when following symlinks hits a cycle
/// - `ErrorKind::InvalidPath` for non-UTF-8 or otherwise malformed paths
pub fn build_snapshot(store: &Store, dir: &Path, opts: &SnapshotOptions) -> Result<SnapshotMeta> {
    let matcher = build_override(dir, opts)?;

    let mut seen: HashMap<String, String> = HashMap::new();
    let mut pending: Vec<(CanonicalPath, std::path::PathBuf)> = Vec::new();

    let walker = WalkDir::new(dir)
        .follow_links(opts.follow_symlinks)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            if e.loop_ancestor().is_some() {
                StoreError::new(
                    crate::error::ErrorKind::SymlinkLoop,
                    format!("symlink cycle under {}", dir.display()),
                )
            } else {
                StoreError::io(format!("walk error: {}", e))
            }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }
        if !opts.follow_symlinks && entry.path_is_symlink() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| StoreError::invalid_path("walk escaped the root"))?;
        let rel_str = rel
            .to_str()
            .ok_or_else(|| StoreError::invalid_path(format!("non-UTF-8 path {:?}", rel)))?;

        let canon = paths::canonicalize(rel_str)?;

        if let Some(matcher) = &matcher {
            if matcher.matched(rel, false).is_ignore() {
                continue;
            }
        }

        if let Some(prev) = seen.insert(canon.path_key.clone(), canon.path.clone()) {
            if prev != canon.path {
                return Err(StoreError::path_collision(&prev, &canon.path, &canon.path_key));
            }
            // Same path observed twice (case-preserving FS quirk): keep one.
            continue;
        }

        pending.push((canon, entry.path().to_path_buf()));
    }

    // Canonical order: path_key ASC, walk order on ties.
    paths::sort_canonical(&mut pending, |p| p.0.path_key.as_str());

    let mut entries = Vec::with_capacity(pending.len());
    let mut total_bytes = 0u64;
    for (canon, abs) in &pending {
        let bytes = fs::read(abs)?;
        let object = store.cas().put(&bytes)?;
        let size = bytes.len() as u64;
        total_bytes += size;

        let metadata = fs::metadata(abs)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        entries.push(FileEntry {
            schema_name: FILE_SCHEMA_NAME.to_string(),
            schema_version: FILE_SCHEMA_VERSION,
            path: canon.path.clone(),
            path_key: canon.path_key.clone(),
            object,
            size,
            lang_hint: lang_hint(&canon.path),
            mode: file_mode(&metadata),
            mtime,
            text_hash: text_hash(&bytes),
        });
        debug!(path = %canon.path, object = %object, "file ingested");
    }

    let snapshot_id = compute_snapshot_id(&entries);
    let snap_dir = store.snapshot_dir(&snapshot_id);
    fs::create_dir_all(&snap_dir)?;
    fsio::write_jsonl_atomic(&snap_dir.join("files.index.jsonl"), &entries)?;

    let meta = SnapshotMeta {
        schema_name: SNAPSHOT_SCHEMA_NAME.to_string(),
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        snapshot_id: snapshot_id.clone(),
        created_at: Utc::now(),
        file_count: entries.len() as u64,
        total_bytes,
    };
    fsio::write_json_atomic(&snap_dir.join("snapshot.json"), &meta)?;
    info!(snapshot_id = %snapshot_id, files = entries.len(), "snapshot written");
    Ok(meta)
}

/// The id hashes only stable fields, so volatile metadata (`mtime`, `mode`)
/// cannot split identical content into distinct snapshots.
fn compute_snapshot_id(entries: &[FileEntry]) -> String {
    let mut hasher = Sha256::new();
    for e in entries {
        let projection = json!({
            "path": e.path,
            "path_key": e.path_key,
            "object": e.object,
            "size": e.size,
            "lang_hint": e.lang_hint,
        });
        hasher.update(projection.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn build_override(dir: &Path, opts: &SnapshotOptions) -> Result<Option<Override>> {
    if opts.include.is_empty() && opts.exclude.is_empty() {
        return Ok(None);
    }
    let mut builder = OverrideBuilder::new(dir);
    for glob in &opts.include {
        builder
            .add(glob)
            .map_err(|e| StoreError::invalid_path(format!("bad include glob {glob:?}: {e}")))?;
    }
    for glob in &opts.exclude {
        builder
            .add(&format!("!{glob}"))
            .map_err(|e| StoreError::invalid_path(format!("bad exclude glob {glob:?}: {e}")))?;
    }
    let matcher = builder
        .build()
        .map_err(|e| StoreError::invalid_path(format!("glob set: {e}")))?;
    Ok(Some(matcher))
}

fn lang_hint(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = name.rsplit_once('.')?;
    let hint = match ext {
        "py" => "python",
        "rs" => "rust",
        "js" => "javascript",
        "ts" => "typescript",
        "java" => "java",
        "go" => "go",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "md" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "txt" => "text",
        _ => return None,
    };
    Some(hint.to_string())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Hash of the line-ending-normalized text, when the bytes are valid UTF-8.
fn text_hash(bytes: &[u8]) -> Option<ObjectHash> {
    let text = std::str::from_utf8(bytes).ok()?;
    let normalized = text.replace("\r\n", "\n");
    Some(ObjectHash::compute(normalized.as_bytes()))
}

/// Load a snapshot's metadata.
pub fn load_snapshot_meta(store: &Store, snapshot_id: &str) -> Result<SnapshotMeta> {
    let path = store.snapshot_dir(snapshot_id).join("snapshot.json");
    if !path.exists() {
        return Err(StoreError::snapshot_not_found(snapshot_id));
    }
    fsio::read_json(&path)
}

/// Load a snapshot's file index, in its stored canonical order.
pub fn load_file_index(store: &Store, snapshot_id: &str) -> Result<Vec<FileEntry>> {
    let path = store.snapshot_dir(snapshot_id).join("files.index.jsonl");
    if !path.exists() {
        return Err(StoreError::snapshot_not_found(snapshot_id));
    }
    fsio::read_jsonl(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let abs = dir.path().join(path);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(abs, content).unwrap();
        }
        dir
    }

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::init(dir.path().join("s")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_dedups_identical_content() {
        let (_sd, store) = test_store();
        let src = fixture(&[("a.txt", "A\n"), ("b.txt", "A\n")]);
        let meta =
            build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();

        assert_eq!(meta.file_count, 2);
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        assert_eq!(entries.len(), 2);
        // identical bytes share one object
        assert_eq!(entries[0].object, entries[1].object);
        assert!(store.cas().has(&entries[0].object));
    }

    #[test]
    fn test_snapshot_idempotent() {
        let (_sd, store) = test_store();
        let src = fixture(&[("x.py", "import sys\n"), ("sub/y.py", "pass\n")]);

        let a = build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let index_a =
            fs::read(store.snapshot_dir(&a.snapshot_id).join("files.index.jsonl")).unwrap();
        let b = build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let index_b =
            fs::read(store.snapshot_dir(&b.snapshot_id).join("files.index.jsonl")).unwrap();

        assert_eq!(a.snapshot_id, b.snapshot_id);
        assert_eq!(index_a, index_b);
    }

    #[test]
    fn test_snapshot_canonical_order() {
        let (_sd, store) = test_store();
        let src = fixture(&[("b.txt", "1"), ("A.txt", "2"), ("c/d.txt", "3")]);
        let meta =
            build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.path_key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "b.txt", "c/d.txt"]);
    }

    #[test]
    fn test_snapshot_empty_file() {
        let (_sd, store) = test_store();
        let src = fixture(&[("empty.bin", "")]);
        let meta =
            build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        assert_eq!(entries[0].size, 0);
        assert_eq!(
            entries[0].object.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_snapshot_exclude_rules() {
        let (_sd, store) = test_store();
        let src = fixture(&[("keep.py", "a"), ("skip.log", "b")]);
        let opts = SnapshotOptions {
            exclude: vec!["*.log".to_string()],
            ..Default::default()
        };
        let meta = build_snapshot(&store, src.path(), &opts).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "keep.py");
    }

    #[test]
    fn test_snapshot_include_rules() {
        let (_sd, store) = test_store();
        let src = fixture(&[("a.py", "a"), ("b.txt", "b"), ("c.py", "c")]);
        let opts = SnapshotOptions {
            include: vec!["*.py".to_string()],
            ..Default::default()
        };
        let meta = build_snapshot(&store, src.path(), &opts).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "c.py"]);
    }

    #[test]
    fn test_snapshot_lang_hint() {
        let (_sd, store) = test_store();
        let src = fixture(&[("m.py", "x"), ("n.unknownext", "y")]);
        let meta =
            build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        assert_eq!(entries[0].lang_hint.as_deref(), Some("python"));
        assert_eq!(entries[1].lang_hint, None);
    }

    #[test]
    fn test_snapshot_id_ignores_mtime() {
        let (_sd, store) = test_store();
        let src = fixture(&[("f.txt", "stable")]);
        let a = build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();

        // re-materialize the same bytes with a fresh mtime
        let src2 = fixture(&[("f.txt", "stable")]);
        let b = build_snapshot(&store, src2.path(), &SnapshotOptions::default()).unwrap();
        assert_eq!(a.snapshot_id, b.snapshot_id);
    }

    #[test]
    fn test_load_missing_snapshot() {
        let (_sd, store) = test_store();
        let err = load_file_index(&store, "deadbeef").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SnapshotNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_rejected() {
        let (_sd, store) = test_store();
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("d")).unwrap();
        std::os::unix::fs::symlink(src.path(), src.path().join("d/back")).unwrap();
        let opts = SnapshotOptions {
            follow_symlinks: true,
            ..Default::default()
        };
        let err = build_snapshot(&store, src.path(), &opts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SymlinkLoop);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_skipped_by_default() {
        let (_sd, store) = test_store();
        let src = fixture(&[("real.txt", "content")]);
        std::os::unix::fs::symlink(src.path().join("real.txt"), src.path().join("link.txt"))
            .unwrap();
        let meta =
            build_snapshot(&store, src.path(), &SnapshotOptions::default()).unwrap();
        let entries = load_file_index(&store, &meta.snapshot_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "real.txt");
    }
}
