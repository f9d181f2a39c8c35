//! Cache builder
//!
//! Ingests the authoritative JSONL sources of one batch into a fresh LMDB
//! environment. Building always starts from an empty environment so no
//! entry from an earlier build can survive into the new one; when the
//! existing cache already matches the current sources (and `--rebuild` was
//! not forced), the build is a no-op.

use std::fs;

use chrono::Utc;
use heed::byteorder::BE;
use heed::types::{SerdeJson, Str, U64};
use heed::{Database, RwTxn};
use tracing::info;

use codebatch_store::{fsio, load_file_index, FileEntry, Store};

use crate::batch::{load_batch, load_plan, outputs_index_path};
use crate::errors::Result;
use crate::outputs::read_outputs_index;
use crate::records::{OutputRecord, RecordKind};

use super::fingerprint::{
    compute_fingerprint, load_cache_meta, CacheMeta, CACHE_META_SCHEMA_NAME,
    CACHE_META_SCHEMA_VERSION,
};
use super::{
    key_join, open_env, DB_DIAGS_BY_CODE, DB_DIAGS_BY_SEV, DB_FILES_BY_PATH, DB_META,
    DB_OUTPUTS_BY_KIND, DB_STATS, KEY_VERSION,
};

type StatsDb = Database<Str, U64<BE>>;

fn bump(db: &StatsDb, wtxn: &mut RwTxn<'_>, key: &str) -> Result<()> {
    let current = db.get(wtxn, key)?.unwrap_or(0);
    db.put(wtxn, key, &(current + 1))?;
    Ok(())
}

/// Build (or refresh) the derived cache for a batch.
pub fn build_index(store: &Store, batch_id: &str, rebuild: bool) -> Result<CacheMeta> {
    let batch = load_batch(store, batch_id)?;
    let plan = load_plan(store, batch_id)?;

    if !rebuild {
        if let Some(existing) = load_cache_meta(store) {
            if existing.batch_id == batch_id {
                if let Ok((fingerprint, _)) = compute_fingerprint(store, &batch, &plan) {
                    if fingerprint == existing.fingerprint {
                        info!(batch_id, "cache already current");
                        return Ok(existing);
                    }
                }
            }
        }
    }

    let lmdb_dir = store.lmdb_dir();
    if lmdb_dir.exists() {
        fs::remove_dir_all(&lmdb_dir)?;
    }
    let env = open_env(&lmdb_dir)?;
    let mut wtxn = env.write_txn()?;

    let meta_db: Database<Str, Str> = env.create_database(&mut wtxn, Some(DB_META))?;
    let files_db: Database<Str, SerdeJson<FileEntry>> =
        env.create_database(&mut wtxn, Some(DB_FILES_BY_PATH))?;
    let outputs_db: Database<Str, SerdeJson<OutputRecord>> =
        env.create_database(&mut wtxn, Some(DB_OUTPUTS_BY_KIND))?;
    let sev_db: Database<Str, SerdeJson<OutputRecord>> =
        env.create_database(&mut wtxn, Some(DB_DIAGS_BY_SEV))?;
    let code_db: Database<Str, SerdeJson<OutputRecord>> =
        env.create_database(&mut wtxn, Some(DB_DIAGS_BY_CODE))?;
    let stats_db: StatsDb = env.create_database(&mut wtxn, Some(DB_STATS))?;

    meta_db.put(
        &mut wtxn,
        "schema_version",
        &CACHE_META_SCHEMA_VERSION.to_string(),
    )?;
    meta_db.put(&mut wtxn, "snapshot_id", &batch.snapshot_id)?;
    meta_db.put(&mut wtxn, "batch_id", &batch.batch_id)?;
    meta_db.put(&mut wtxn, "built_at", &Utc::now().to_rfc3339())?;

    for entry in load_file_index(store, &batch.snapshot_id)? {
        let key = key_join(&[KEY_VERSION, &batch.snapshot_id, &entry.path]);
        files_db.put(&mut wtxn, &key, &entry)?;
    }

    let mut task_ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    task_ids.sort_unstable();

    for task_id in task_ids {
        for shard_id in plan.shard.all_shard_ids() {
            let index_path = outputs_index_path(store, batch_id, task_id, &shard_id);
            for (seq, record) in read_outputs_index(&index_path)?.iter().enumerate() {
                // ordinal suffix keeps duplicate canonical keys distinct
                let seq = format!("{:06}", seq);
                let kind = record.kind.as_str();

                let output_key = key_join(&[
                    KEY_VERSION,
                    &batch.snapshot_id,
                    &batch.batch_id,
                    task_id,
                    kind,
                    &record.path,
                    &seq,
                ]);
                outputs_db.put(&mut wtxn, &output_key, record)?;

                let kind_counter = key_join(&[
                    KEY_VERSION,
                    &batch.snapshot_id,
                    &batch.batch_id,
                    task_id,
                    "kind",
                    kind,
                ]);
                bump(&stats_db, &mut wtxn, &kind_counter)?;

                if record.kind == RecordKind::Diagnostic {
                    let severity = record.severity.map_or("unknown", |s| s.as_str());
                    let code = record.code.as_deref().unwrap_or("unknown");
                    let line = format!("{:06}", record.line.unwrap_or(0));
                    let column = format!("{:06}", record.column.unwrap_or(0));

                    let sev_key = key_join(&[
                        KEY_VERSION,
                        &batch.snapshot_id,
                        &batch.batch_id,
                        task_id,
                        severity,
                        code,
                        &record.path,
                        &line,
                        &column,
                        &seq,
                    ]);
                    sev_db.put(&mut wtxn, &sev_key, record)?;

                    let code_key = key_join(&[
                        KEY_VERSION,
                        &batch.snapshot_id,
                        &batch.batch_id,
                        task_id,
                        code,
                        severity,
                        &record.path,
                        &line,
                        &column,
                        &seq,
                    ]);
                    code_db.put(&mut wtxn, &code_key, record)?;

                    let diag_counter = key_join(&[
                        KEY_VERSION,
                        &batch.snapshot_id,
                        &batch.batch_id,
                        task_id,
                        "diag",
                        severity,
                        code,
                    ]);
                    bump(&stats_db, &mut wtxn, &diag_counter)?;
                }
            }
        }
    }

    wtxn.commit()?;
    drop(env);

    let (fingerprint, sources) = compute_fingerprint(store, &batch, &plan)?;
    let meta = CacheMeta {
        schema_name: CACHE_META_SCHEMA_NAME.to_string(),
        schema_version: CACHE_META_SCHEMA_VERSION,
        fingerprint,
        batch_id: batch.batch_id.clone(),
        snapshot_id: batch.snapshot_id.clone(),
        built_at: Utc::now(),
        sources,
    };
    fsio::write_json_atomic(&lmdb_dir.join("cache_meta.json"), &meta)?;
    info!(batch_id, sources = meta.sources.len(), "cache built");
    Ok(meta)
}
