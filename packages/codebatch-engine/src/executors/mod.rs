//! Executor interface and registry
//!
//! An executor is a pure, deterministic function over
//! `(config, files, prior_outputs)`. The runner provides the context; the
//! executor returns drafts and never observes wall-clock time, the store
//! layout, or anything outside its shard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use codebatch_store::{FileEntry, ObjectHash, ObjectStore, Store};

use crate::batch;
use crate::errors::{EngineError, Result};
use crate::outputs::{self, ChunkPolicy};
use crate::records::{OutputDraft, OutputRecord, RecordKind};

pub mod outline;

mod analyze;
mod lint;
mod parse;
mod symbols;

pub use analyze::AnalyzeExecutor;
pub use lint::LintExecutor;
pub use parse::ParseExecutor;
pub use symbols::SymbolsExecutor;

/// One snapshot file visible to a shard
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub path: String,
    pub path_key: String,
    pub object: ObjectHash,
    pub size: u64,
    pub lang_hint: Option<String>,
}

impl From<&FileEntry> for ShardFile {
    fn from(entry: &FileEntry) -> Self {
        Self {
            path: entry.path.clone(),
            path_key: entry.path_key.clone(),
            object: entry.object,
            size: entry.size,
            lang_hint: entry.lang_hint.clone(),
        }
    }
}

/// Capabilities the runner lends to an executor for one shard.
///
/// Object writes go straight to the CAS (safe: the CAS is add-only), and
/// prior-output reads are restricted to the running task's declared deps
/// within the same shard.
pub struct ExecutorContext<'a> {
    store: &'a Store,
    batch_id: &'a str,
    shard_id: &'a str,
    deps: &'a [String],
    cancel: &'a AtomicBool,
    chunk_policy: ChunkPolicy,
}

impl<'a> ExecutorContext<'a> {
    pub fn new(
        store: &'a Store,
        batch_id: &'a str,
        shard_id: &'a str,
        deps: &'a [String],
        cancel: &'a AtomicBool,
        chunk_policy: ChunkPolicy,
    ) -> Self {
        Self {
            store,
            batch_id,
            shard_id,
            deps,
            cancel,
            chunk_policy,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub fn cas(&self) -> &ObjectStore {
        self.store.cas()
    }

    /// Store payload bytes, chunking large ones. Returns the object to
    /// reference and the effective format.
    pub fn put_object(
        &self,
        kind: RecordKind,
        format: Option<&str>,
        bytes: &[u8],
    ) -> Result<(ObjectHash, Option<String>)> {
        self.check_cancel()?;
        outputs::store_payload(self.cas(), kind, format, bytes, self.chunk_policy)
    }

    /// Read an object back, reassembling chunk manifests.
    pub fn get_object(&self, object: &ObjectHash) -> Result<Vec<u8>> {
        self.check_cancel()?;
        outputs::load_payload(self.cas(), object)
    }

    /// Outputs a declared dependency produced for this shard.
    pub fn iter_prior_outputs(
        &self,
        task_id: &str,
        kind: Option<RecordKind>,
    ) -> Result<Vec<OutputRecord>> {
        self.check_cancel()?;
        if !self.deps.iter().any(|d| d == task_id) {
            return Err(EngineError::plan(format!(
                "prior outputs of {task_id:?} are not visible: not a declared dependency"
            )));
        }
        let path =
            batch::outputs_index_path(self.store, self.batch_id, task_id, self.shard_id);
        let mut records = outputs::read_outputs_index(&path)?;
        if let Some(kind) = kind {
            records.retain(|r| r.kind == kind);
        }
        Ok(records)
    }
}

/// A pipeline stage implementation
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        config: &serde_json::Value,
        files: &[ShardFile],
        ctx: &ExecutorContext<'_>,
    ) -> Result<Vec<OutputDraft>>;
}

pub mod registry {
    //! Static executor registry; plan validation checks membership here.

    use super::*;

    type Factory = fn() -> Box<dyn Executor>;

    static REGISTRY: Lazy<BTreeMap<&'static str, Factory>> = Lazy::new(|| {
        let mut map: BTreeMap<&'static str, Factory> = BTreeMap::new();
        map.insert("parse", || Box::new(ParseExecutor));
        map.insert("analyze", || Box::new(AnalyzeExecutor));
        map.insert("symbols", || Box::new(SymbolsExecutor));
        map.insert("lint", || Box::new(LintExecutor));
        map
    });

    pub fn is_registered(task_type: &str) -> bool {
        REGISTRY.contains_key(task_type)
    }

    pub fn registered_types() -> Vec<&'static str> {
        REGISTRY.keys().copied().collect()
    }

    pub fn create(task_type: &str) -> Result<Box<dyn Executor>> {
        REGISTRY
            .get(task_type)
            .map(|factory| factory())
            .ok_or_else(|| {
                EngineError::plan(format!("no executor registered for type {task_type:?}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_membership() {
        assert!(registry::is_registered("parse"));
        assert!(registry::is_registered("lint"));
        assert!(!registry::is_registered("transmogrify"));
    }

    #[test]
    fn test_registry_create() {
        assert!(registry::create("analyze").is_ok());
        assert!(registry::create("nope").is_err());
    }

    #[test]
    fn test_registered_types_sorted() {
        let types = registry::registered_types();
        assert_eq!(types, vec!["analyze", "lint", "parse", "symbols"]);
    }
}
