//! Shard runner and batch wavefront
//!
//! The runner owns the state machine and atomic commit. A shard buffers
//! every record locally, stamps headers, replaces its outputs index whole,
//! then flips state. A crash mid-run leaves orphan CAS blobs (harmless) and
//! a stale `running` state; re-running the shard is always safe because the
//! index is a complete replacement.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use codebatch_store::{load_file_index, Store};

use crate::batch::{
    batch_events_path, load_batch, load_plan, outputs_index_path, state_path, task_events_path,
    BatchMeta,
};
use crate::errors::{EngineError, Result};
use crate::events::EventWriter;
use crate::executors::{registry, ExecutorContext, ShardFile};
use crate::outputs::{self, ChunkPolicy};
use crate::plan::{Plan, TaskSpec};
use crate::records::RecordHeader;
use crate::state::{self, ShardState};

/// Knobs for [`run_batch`]
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Worker pool size
    pub workers: usize,
    /// Skip shards already `done`
    pub resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            resume: false,
        }
    }
}

/// Per-batch tally returned by [`run_batch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub done: usize,
    pub failed: usize,
    /// Shards deferred because a dependency shard is not `done`
    pub skipped: usize,
}

fn chunk_policy_of(task: &TaskSpec) -> ChunkPolicy {
    let mut policy = ChunkPolicy::default();
    if let Some(threshold) = task.config.get("chunk_threshold").and_then(|v| v.as_u64()) {
        policy.threshold = threshold as usize;
    }
    if let Some(size) = task.config.get("chunk_size").and_then(|v| v.as_u64()) {
        policy.chunk_size = size as usize;
    }
    policy
}

/// Execute one shard of one task.
///
/// Returns the number of committed records. On executor failure the shard
/// moves to `failed`; on cancellation it stays `running` with nothing
/// committed.
pub fn run_shard(
    store: &Store,
    batch_meta: &BatchMeta,
    plan: &Plan,
    task: &TaskSpec,
    shard_id: &str,
    cancel: &AtomicBool,
    events: Option<&EventWriter>,
) -> Result<usize> {
    if !plan.shard.is_valid_shard_id(shard_id) {
        return Err(EngineError::plan(format!(
            "invalid shard id {shard_id:?} for this plan"
        )));
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(EngineError::Cancelled);
    }

    // All dep shards with this shard id must be done before we start.
    for dep in &task.deps {
        let dep_state = state::load_state(&state_path(store, &batch_meta.batch_id, dep, shard_id))?;
        if dep_state.state != ShardState::Done {
            return Err(EngineError::DepsUnsatisfied {
                task: task.id.clone(),
                dep: dep.clone(),
                shard: shard_id.to_string(),
            });
        }
    }

    let files: Vec<ShardFile> = load_file_index(store, &batch_meta.snapshot_id)?
        .iter()
        .filter(|entry| plan.shard.shard_of(&entry.path_key) == shard_id)
        .map(ShardFile::from)
        .collect();

    let st_path = state_path(store, &batch_meta.batch_id, &task.id, shard_id);
    let current = state::load_state(&st_path)?;
    if current.state.is_terminal() {
        // re-run of a terminal shard: reset first
        state::transition(&st_path, ShardState::Pending, None)?;
    }
    state::transition(&st_path, ShardState::Running, None)?;
    if let Some(events) = events {
        events.emit("shard_started", Some(&task.id), Some(shard_id), None);
    }

    let executor = registry::create(&task.task_type)?;
    let ctx = ExecutorContext::new(
        store,
        &batch_meta.batch_id,
        shard_id,
        &task.deps,
        cancel,
        chunk_policy_of(task),
    );

    let drafts = match executor.execute(&task.config, &files, &ctx) {
        Ok(drafts) => drafts,
        Err(EngineError::Cancelled) => {
            // state stays `running`; resuming retries the shard
            return Err(EngineError::Cancelled);
        }
        Err(e) => {
            let message = e.to_string();
            state::transition(&st_path, ShardState::Failed, Some(message.clone()))?;
            if let Some(events) = events {
                events.emit("shard_failed", Some(&task.id), Some(shard_id), Some(&message));
            }
            return Err(EngineError::ExecutorFailed {
                task: task.id.clone(),
                shard: shard_id.to_string(),
                message,
            });
        }
    };

    for draft in &drafts {
        if let Err(e) = draft.validate() {
            let message = e.to_string();
            state::transition(&st_path, ShardState::Failed, Some(message.clone()))?;
            if let Some(events) = events {
                events.emit("shard_failed", Some(&task.id), Some(shard_id), Some(&message));
            }
            return Err(e);
        }
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(EngineError::Cancelled);
    }

    // The runner, not the executor, stamps time.
    let header = RecordHeader {
        snapshot_id: batch_meta.snapshot_id.clone(),
        batch_id: batch_meta.batch_id.clone(),
        task_id: task.id.clone(),
        shard_id: shard_id.to_string(),
        ts: Utc::now(),
    };
    let records: Vec<_> = drafts
        .into_iter()
        .map(|draft| draft.into_record(&header))
        .collect();

    let index_path = outputs_index_path(store, &batch_meta.batch_id, &task.id, shard_id);
    outputs::write_outputs_index(&index_path, &records)?;
    state::transition(&st_path, ShardState::Done, None)?;

    if let Some(events) = events {
        let detail = format!("{} records", records.len());
        events.emit("shard_completed", Some(&task.id), Some(shard_id), Some(&detail));
    }
    debug!(task = %task.id, shard = %shard_id, records = records.len(), "shard done");
    Ok(records.len())
}

/// Operator action: put a terminal shard back to `pending`.
pub fn reset_shard(store: &Store, batch_id: &str, task_id: &str, shard_id: &str) -> Result<()> {
    let path = state_path(store, batch_id, task_id, shard_id);
    state::transition(&path, ShardState::Pending, None)?;
    Ok(())
}

/// Drive all shards of a batch to completion, honoring deps.
///
/// Tasks run in plan order (deps reference earlier entries only); shards of
/// one task run in parallel on a bounded pool. A failed shard never poisons
/// its peers; dependent shards of a failed one are counted as skipped.
pub fn run_batch(
    store: &Store,
    batch_id: &str,
    opts: RunOptions,
    cancel: &AtomicBool,
) -> Result<BatchSummary> {
    let _lock = store.lock_exclusive()?;
    let batch_meta = load_batch(store, batch_id)?;
    let plan = load_plan(store, batch_id)?;

    let batch_events = EventWriter::open(&batch_events_path(store, batch_id))?;
    batch_events.emit("batch_started", None, None, Some(&plan.pipeline));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers.max(1))
        .build()
        .map_err(|e| EngineError::internal(format!("worker pool: {e}")))?;

    let mut summary = BatchSummary::default();
    let mut cancelled = false;

    for task in &plan.tasks {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }
        let task_events = EventWriter::open(&task_events_path(store, batch_id, &task.id))?;

        let mut shard_ids = plan.shard.all_shard_ids();
        if opts.resume {
            let mut pending = Vec::with_capacity(shard_ids.len());
            for shard_id in shard_ids {
                let st =
                    state::load_state(&state_path(store, batch_id, &task.id, &shard_id))?;
                if st.state != ShardState::Done {
                    pending.push(shard_id);
                }
            }
            shard_ids = pending;
        }

        let results: Vec<Result<usize>> = pool.install(|| {
            shard_ids
                .par_iter()
                .map(|shard_id| {
                    run_shard(
                        store,
                        &batch_meta,
                        &plan,
                        task,
                        shard_id,
                        cancel,
                        Some(&task_events),
                    )
                })
                .collect()
        });

        for result in results {
            match result {
                Ok(_) => summary.done += 1,
                Err(EngineError::DepsUnsatisfied { .. }) => summary.skipped += 1,
                Err(EngineError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(task = %task.id, error = %e, "shard failed");
                    summary.failed += 1;
                }
            }
        }
    }

    if cancelled {
        batch_events.emit("batch_cancelled", None, None, None);
        return Err(EngineError::Cancelled);
    }

    let detail = format!(
        "done={} failed={} skipped={}",
        summary.done, summary.failed, summary.skipped
    );
    batch_events.emit("batch_completed", None, None, Some(&detail));
    info!(batch_id, %detail, "batch run finished");
    Ok(summary)
}
