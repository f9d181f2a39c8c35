//! Batch lifecycle and on-disk layout
//!
//! A batch binds one execution attempt to one snapshot:
//!
//! ```text
//! batches/<batch_id>/
//!   batch.json
//!   plan.json
//!   events.jsonl
//!   tasks/<task_id>/
//!     task.json
//!     events.jsonl
//!     shards/<shard_id>/{state.json, outputs.index.jsonl}
//! ```

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use codebatch_store::{fsio, load_snapshot_meta, Store};

use crate::errors::{EngineError, Result};
use crate::plan::{Plan, ShardStrategy};

pub const BATCH_SCHEMA_NAME: &str = "codebatch.batch";
pub const BATCH_SCHEMA_VERSION: u32 = 1;
pub const TASK_SCHEMA_NAME: &str = "codebatch.task";
pub const TASK_SCHEMA_VERSION: u32 = 1;

/// `batch.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMeta {
    pub schema_name: String,
    pub schema_version: u32,
    pub batch_id: String,
    pub snapshot_id: String,
    pub pipeline: String,
    pub created_at: DateTime<Utc>,
}

/// Materialize a new batch for a snapshot: `batch.json`, `plan.json`, and
/// one task directory per stage.
pub fn init_batch(
    store: &Store,
    snapshot_id: &str,
    pipeline: &str,
    shard: ShardStrategy,
) -> Result<BatchMeta> {
    // Fails with SNAPSHOT_NOT_FOUND before anything is written.
    load_snapshot_meta(store, snapshot_id)?;

    let plan = Plan::for_pipeline(pipeline, shard)?;
    let batch_id = Uuid::new_v4().simple().to_string();
    let meta = BatchMeta {
        schema_name: BATCH_SCHEMA_NAME.to_string(),
        schema_version: BATCH_SCHEMA_VERSION,
        batch_id: batch_id.clone(),
        snapshot_id: snapshot_id.to_string(),
        pipeline: pipeline.to_string(),
        created_at: Utc::now(),
    };

    let dir = store.batch_dir(&batch_id);
    fs::create_dir_all(&dir)?;
    fsio::write_json_atomic(&dir.join("batch.json"), &meta)?;
    fsio::write_json_atomic(&dir.join("plan.json"), &plan)?;
    for task in &plan.tasks {
        let task_dir = task_dir(store, &batch_id, &task.id);
        fs::create_dir_all(task_dir.join("shards"))?;
        let record = serde_json::json!({
            "schema_name": TASK_SCHEMA_NAME,
            "schema_version": TASK_SCHEMA_VERSION,
            "id": task.id,
            "type": task.task_type,
            "deps": task.deps,
            "config": task.config,
        });
        fsio::write_json_atomic(&task_dir.join("task.json"), &record)?;
    }
    info!(batch_id = %batch_id, pipeline, "batch initialized");
    Ok(meta)
}

pub fn load_batch(store: &Store, batch_id: &str) -> Result<BatchMeta> {
    let path = store.batch_dir(batch_id).join("batch.json");
    if !path.exists() {
        return Err(EngineError::BatchNotFound(batch_id.to_string()));
    }
    Ok(fsio::read_json(&path)?)
}

pub fn load_plan(store: &Store, batch_id: &str) -> Result<Plan> {
    let path = store.batch_dir(batch_id).join("plan.json");
    if !path.exists() {
        return Err(EngineError::BatchNotFound(batch_id.to_string()));
    }
    let plan: Plan = fsio::read_json(&path)?;
    plan.validate()?;
    Ok(plan)
}

pub fn task_dir(store: &Store, batch_id: &str, task_id: &str) -> PathBuf {
    store.batch_dir(batch_id).join("tasks").join(task_id)
}

pub fn shard_dir(store: &Store, batch_id: &str, task_id: &str, shard_id: &str) -> PathBuf {
    task_dir(store, batch_id, task_id)
        .join("shards")
        .join(shard_id)
}

pub fn state_path(store: &Store, batch_id: &str, task_id: &str, shard_id: &str) -> PathBuf {
    shard_dir(store, batch_id, task_id, shard_id).join("state.json")
}

pub fn outputs_index_path(
    store: &Store,
    batch_id: &str,
    task_id: &str,
    shard_id: &str,
) -> PathBuf {
    shard_dir(store, batch_id, task_id, shard_id).join("outputs.index.jsonl")
}

pub fn batch_events_path(store: &Store, batch_id: &str) -> PathBuf {
    store.batch_dir(batch_id).join("events.jsonl")
}

pub fn task_events_path(store: &Store, batch_id: &str, task_id: &str) -> PathBuf {
    task_dir(store, batch_id, task_id).join("events.jsonl")
}
