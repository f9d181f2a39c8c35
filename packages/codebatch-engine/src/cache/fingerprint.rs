//! Cache source fingerprint
//!
//! `fingerprint = SHA-256( SHA-256(files.index.jsonl) ‖ Σ SHA-256(shard
//! outputs.index.jsonl) )`, with Σ concatenating raw digests in canonical
//! `(task_id ASC, shard_id ASC)` order. The fingerprint and the source
//! inventory live in `cache_meta.json` next to the LMDB data files; a
//! mismatch against the current sources marks the whole cache stale.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use codebatch_store::{fsio, Store};

use crate::batch::{outputs_index_path, BatchMeta};
use crate::errors::Result;
use crate::plan::Plan;

pub const CACHE_META_SCHEMA_NAME: &str = "codebatch.cache_meta";
pub const CACHE_META_SCHEMA_VERSION: u32 = 1;

/// One authoritative source that fed the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Path relative to the store root
    pub path: String,
    pub sha256: String,
}

/// `cache_meta.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub schema_name: String,
    pub schema_version: u32,
    pub fingerprint: String,
    pub batch_id: String,
    pub snapshot_id: String,
    pub built_at: DateTime<Utc>,
    pub sources: Vec<SourceEntry>,
}

fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn rel_to_store(store: &Store, path: &Path) -> String {
    path.strip_prefix(store.root())
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Hash the authoritative sources of a batch.
///
/// Shard indexes that do not exist yet (shards never run) are not part of
/// the fingerprint; when they appear, the fingerprint changes and the cache
/// goes stale.
pub fn compute_fingerprint(
    store: &Store,
    batch: &BatchMeta,
    plan: &Plan,
) -> Result<(String, Vec<SourceEntry>)> {
    let mut outer = Sha256::new();
    let mut sources = Vec::new();

    let files_index = store
        .snapshot_dir(&batch.snapshot_id)
        .join("files.index.jsonl");
    let files_digest = sha256_file(&files_index)?;
    outer.update(files_digest);
    sources.push(SourceEntry {
        path: rel_to_store(store, &files_index),
        sha256: hex(&files_digest),
    });

    let mut task_ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    task_ids.sort_unstable();

    for task_id in task_ids {
        for shard_id in plan.shard.all_shard_ids() {
            let path = outputs_index_path(store, &batch.batch_id, task_id, &shard_id);
            if !path.exists() {
                continue;
            }
            let digest = sha256_file(&path)?;
            outer.update(digest);
            sources.push(SourceEntry {
                path: rel_to_store(store, &path),
                sha256: hex(&digest),
            });
        }
    }

    let fingerprint: [u8; 32] = outer.finalize().into();
    Ok((hex(&fingerprint), sources))
}

/// Read `cache_meta.json`, if present and well formed.
pub fn load_cache_meta(store: &Store) -> Option<CacheMeta> {
    let path = store.lmdb_dir().join("cache_meta.json");
    if !path.exists() {
        return None;
    }
    let meta: CacheMeta = fsio::read_json(&path).ok()?;
    if meta.schema_name != CACHE_META_SCHEMA_NAME {
        return None;
    }
    Some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{init_batch, load_plan};
    use crate::plan::ShardStrategy;
    use crate::runner::{run_batch, RunOptions};
    use codebatch_store::{build_snapshot, SnapshotOptions};
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn run_fixture() -> (TempDir, Store, BatchMeta, Plan) {
        let dir = TempDir::new().unwrap();
        let store = Store::init(dir.path().join("s")).unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("m.py"), "import sys\n").unwrap();
        let snap = build_snapshot(&store, &src, &SnapshotOptions::default()).unwrap();
        let meta = init_batch(&store, &snap.snapshot_id, "lint", ShardStrategy::new(1).unwrap())
            .unwrap();
        let cancel = AtomicBool::new(false);
        run_batch(&store, &meta.batch_id, RunOptions::default(), &cancel).unwrap();
        let plan = load_plan(&store, &meta.batch_id).unwrap();
        (dir, store, meta, plan)
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let (_dir, store, meta, plan) = run_fixture();
        let (fp1, sources1) = compute_fingerprint(&store, &meta, &plan).unwrap();
        let (fp2, sources2) = compute_fingerprint(&store, &meta, &plan).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(sources1, sources2);
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_sources() {
        let (_dir, store, meta, plan) = run_fixture();
        let (before, _) = compute_fingerprint(&store, &meta, &plan).unwrap();

        // touch one shard's outputs
        let shard = plan.shard.shard_of("m.py");
        let path = outputs_index_path(&store, &meta.batch_id, "lint", &shard);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push('\n');
        std::fs::write(&path, text).unwrap();

        let (after, _) = compute_fingerprint(&store, &meta, &plan).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_sources_inventory_lists_files_index_first() {
        let (_dir, store, meta, plan) = run_fixture();
        let (_fp, sources) = compute_fingerprint(&store, &meta, &plan).unwrap();
        assert!(sources[0].path.ends_with("files.index.jsonl"));
        assert!(sources.len() > 1);
    }
}
