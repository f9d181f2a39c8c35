//! Scan query engine
//!
//! The authoritative query path: iterate the relevant shards'
//! `outputs.index.jsonl`, filter, and impose canonical order
//! `(path_key, kind, line, column, code)`. No locks are taken; indexes are
//! tmp-renamed, so a reader always sees a fully formed file.

use std::collections::BTreeMap;

use codebatch_store::{path_key_of, Store};

use crate::batch::{load_batch, load_plan, outputs_index_path};
use crate::errors::Result;
use crate::outputs::read_outputs_index;
use crate::records::{OutputRecord, RecordKind, Severity};

/// Filters shared by all query shapes
#[derive(Debug, Clone, Default)]
pub struct OutputFilter {
    pub task: Option<String>,
    pub kind: Option<RecordKind>,
    pub path: Option<String>,
    pub severity: Option<Severity>,
}

impl OutputFilter {
    pub fn matches(&self, record: &OutputRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if path_key_of(&record.path) != path_key_of(path) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if record.severity != Some(severity) {
                return false;
            }
        }
        true
    }
}

/// Stats grouping axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsGroupBy {
    Kind,
    SeverityCode,
}

/// Scan a batch's outputs.
pub fn scan_outputs(store: &Store, batch_id: &str, filter: &OutputFilter) -> Result<Vec<OutputRecord>> {
    load_batch(store, batch_id)?;
    let plan = load_plan(store, batch_id)?;

    let task_ids: Vec<String> = match &filter.task {
        Some(task) => vec![plan.task(task)?.id.clone()],
        None => plan.tasks.iter().map(|t| t.id.clone()).collect(),
    };

    let mut records = Vec::new();
    for task_id in &task_ids {
        for shard_id in plan.shard.all_shard_ids() {
            let path = outputs_index_path(store, batch_id, task_id, &shard_id);
            for record in read_outputs_index(&path)? {
                if filter.matches(&record) {
                    records.push(record);
                }
            }
        }
    }
    records.sort_by(|a, b| a.scan_sort_key().cmp(&b.scan_sort_key()));
    Ok(records)
}

/// Sugar: scan only diagnostics.
pub fn scan_diagnostics(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
) -> Result<Vec<OutputRecord>> {
    let filter = OutputFilter {
        kind: Some(RecordKind::Diagnostic),
        ..filter.clone()
    };
    scan_outputs(store, batch_id, &filter)
}

/// Count records grouped by kind or by `(severity, code)`.
///
/// Group keys are `<kind>` or `<severity>:<code>`.
pub fn scan_stats(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
    group_by: StatsGroupBy,
) -> Result<BTreeMap<String, u64>> {
    let records = scan_outputs(store, batch_id, filter)?;
    Ok(group_stats(&records, group_by))
}

/// Shared grouping used by both the scan path and the cache router's
/// equivalence tests.
pub fn group_stats(records: &[OutputRecord], group_by: StatsGroupBy) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for record in records {
        let key = match group_by {
            StatsGroupBy::Kind => record.kind.as_str().to_string(),
            StatsGroupBy::SeverityCode => {
                if record.kind != RecordKind::Diagnostic {
                    continue;
                }
                let severity = record
                    .severity
                    .map_or("unknown", |s| s.as_str());
                let code = record.code.as_deref().unwrap_or("unknown");
                format!("{severity}:{code}")
            }
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}
