//! codebatch-engine — batch execution and query layer
//!
//! Turns a snapshot plus a pipeline plan into reproducible, queryable
//! artifacts:
//!
//! - **Plan**: ordered tasks with backward-referencing deps
//! - **Runner**: deterministic shard execution with atomic output commit
//! - **Outputs**: append-only JSONL indexes and CAS chunk manifests
//! - **Query**: authoritative scan path plus a derived LMDB cache that is
//!   bypassed the moment its fingerprint goes stale
//! - **Diff**: canonical-key comparison of two batches
//!
//! The store root on disk is the only shared state; re-running any shard of
//! any batch against the same snapshot reproduces its outputs byte for byte
//! (modulo the runner-stamped `ts`).

pub mod batch;
pub mod cache;
pub mod diff;
pub mod errors;
pub mod events;
pub mod executors;
pub mod outputs;
pub mod plan;
pub mod query;
pub mod records;
pub mod runner;
pub mod state;

pub use batch::{init_batch, load_batch, load_plan, BatchMeta};
pub use cache::{build_index, query_diagnostics, query_outputs, query_stats, QuerySource};
pub use diff::{diff_batches, diff_records, improvements, regressions, DiffReport};
pub use errors::{EngineError, ErrorEnvelope, Result};
pub use plan::{Plan, ShardStrategy, TaskSpec};
pub use query::{OutputFilter, StatsGroupBy};
pub use records::{OutputDraft, OutputRecord, RecordKind, Severity};
pub use runner::{run_batch, run_shard, BatchSummary, RunOptions};
pub use state::ShardState;
