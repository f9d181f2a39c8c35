//! Derived LMDB query cache
//!
//! Everything under `indexes/lmdb/` is derived state: a faithful,
//! rebuildable mirror of the authoritative JSONL sources. It can be deleted
//! at any time with no loss of truth, and a stale cache is never consulted.
//!
//! Named sub-databases:
//! - `meta`           — build metadata (schema version, batch, snapshot)
//! - `files_by_path`  — snapshot file index
//! - `outputs_by_kind`— all output records
//! - `diags_by_sev`   — diagnostics keyed severity-first
//! - `diags_by_code`  — diagnostics keyed code-first
//! - `stats`          — 8-byte big-endian u64 counters
//!
//! Keys are UTF-8 segments joined by the unit separator (0x1F), prefixed
//! with the key-schema version.

use std::path::Path;

use heed::{Env, EnvOpenOptions};

use crate::errors::Result;

mod builder;
mod fingerprint;
mod router;

pub use builder::build_index;
pub use fingerprint::{compute_fingerprint, load_cache_meta, CacheMeta, SourceEntry};
pub use router::{
    cache_is_valid, query_diagnostics, query_outputs, query_outputs_traced, query_stats,
    query_stats_traced, QuerySource,
};

pub const DB_META: &str = "meta";
pub const DB_FILES_BY_PATH: &str = "files_by_path";
pub const DB_OUTPUTS_BY_KIND: &str = "outputs_by_kind";
pub const DB_DIAGS_BY_SEV: &str = "diags_by_sev";
pub const DB_DIAGS_BY_CODE: &str = "diags_by_code";
pub const DB_STATS: &str = "stats";

/// Key segment separator (unit separator)
pub const KEY_SEP: char = '\u{1f}';
/// Key schema version prefix
pub const KEY_VERSION: &str = "v1";

/// Default LMDB map size in megabytes.
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 1024;
/// Upper bound honored for the env-var override.
pub const MAX_LMDB_MAP_SIZE_MB: usize = 8192;

/// Join key segments with the unit separator.
pub fn key_join(segments: &[&str]) -> String {
    let mut key = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(segment);
    }
    key
}

fn map_size_bytes() -> usize {
    let mb = std::env::var("CODEBATCH_LMDB_MAP_SIZE_MB")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LMDB_MAP_SIZE_MB)
        .clamp(1, MAX_LMDB_MAP_SIZE_MB);
    mb * 1024 * 1024
}

/// Open (or create) the cache environment at `indexes/lmdb/`.
pub fn open_env(dir: &Path) -> Result<Env> {
    std::fs::create_dir_all(dir)?;
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size_bytes())
            .max_dbs(6)
            .open(dir)?
    };
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_join_uses_unit_separator() {
        let key = key_join(&[KEY_VERSION, "snap", "batch"]);
        assert_eq!(key, "v1\u{1f}snap\u{1f}batch");
    }

    #[test]
    fn test_key_join_single_segment() {
        assert_eq!(key_join(&["v1"]), "v1");
    }
}
