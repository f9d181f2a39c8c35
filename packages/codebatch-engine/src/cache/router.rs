//! Cache validator and query router
//!
//! Every query with a batch context goes through here: when the cache's
//! fingerprint matches the current authoritative sources the query is
//! served from LMDB, otherwise it silently falls back to the scan path.
//! A single query never mixes sources.

use std::collections::BTreeMap;

use heed::types::{SerdeJson, Str, U64};
use heed::{byteorder::BE, Database};
use tracing::{debug, warn};

use codebatch_store::Store;

use crate::batch::{load_batch, load_plan, BatchMeta};
use crate::errors::Result;
use crate::plan::Plan;
use crate::query::{group_stats, scan_outputs, scan_stats, OutputFilter, StatsGroupBy};
use crate::records::{OutputRecord, RecordKind};

use super::fingerprint::{compute_fingerprint, load_cache_meta};
use super::{key_join, open_env, DB_OUTPUTS_BY_KIND, DB_STATS, KEY_SEP, KEY_VERSION};

/// Which side actually answered a routed query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Cache,
    Scan,
}

/// Fingerprint check: does the cache mirror the current sources?
pub fn cache_is_valid(store: &Store, batch: &BatchMeta, plan: &Plan) -> bool {
    let Some(meta) = load_cache_meta(store) else {
        return false;
    };
    if meta.batch_id != batch.batch_id {
        return false;
    }
    match compute_fingerprint(store, batch, plan) {
        Ok((fingerprint, _)) => fingerprint == meta.fingerprint,
        Err(_) => false,
    }
}

/// Routed output query, reporting which source served it.
pub fn query_outputs_traced(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
) -> Result<(Vec<OutputRecord>, QuerySource)> {
    let batch = load_batch(store, batch_id)?;
    let plan = load_plan(store, batch_id)?;
    if let Some(task) = &filter.task {
        plan.task(task)?;
    }

    if cache_is_valid(store, &batch, &plan) {
        match cache_outputs(store, &batch, &plan, filter) {
            Ok(Some(records)) => return Ok((records, QuerySource::Cache)),
            Ok(None) => debug!("cache env missing, scanning"),
            Err(e) => warn!(error = %e, "cache read failed, scanning"),
        }
    }
    Ok((scan_outputs(store, batch_id, filter)?, QuerySource::Scan))
}

pub fn query_outputs(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
) -> Result<Vec<OutputRecord>> {
    Ok(query_outputs_traced(store, batch_id, filter)?.0)
}

pub fn query_diagnostics(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
) -> Result<Vec<OutputRecord>> {
    let filter = OutputFilter {
        kind: Some(RecordKind::Diagnostic),
        ..filter.clone()
    };
    query_outputs(store, batch_id, &filter)
}

/// Routed stats query, reporting which source served it.
pub fn query_stats_traced(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
    group_by: StatsGroupBy,
) -> Result<(BTreeMap<String, u64>, QuerySource)> {
    let batch = load_batch(store, batch_id)?;
    let plan = load_plan(store, batch_id)?;
    if let Some(task) = &filter.task {
        plan.task(task)?;
    }

    if cache_is_valid(store, &batch, &plan) {
        match cache_stats(store, &batch, &plan, filter, group_by) {
            Ok(Some(stats)) => return Ok((stats, QuerySource::Cache)),
            Ok(None) => debug!("cache env missing, scanning"),
            Err(e) => warn!(error = %e, "cache read failed, scanning"),
        }
    }
    Ok((
        scan_stats(store, batch_id, filter, group_by)?,
        QuerySource::Scan,
    ))
}

pub fn query_stats(
    store: &Store,
    batch_id: &str,
    filter: &OutputFilter,
    group_by: StatsGroupBy,
) -> Result<BTreeMap<String, u64>> {
    Ok(query_stats_traced(store, batch_id, filter, group_by)?.0)
}

fn task_ids(plan: &Plan, filter: &OutputFilter) -> Vec<String> {
    match &filter.task {
        Some(task) => vec![task.clone()],
        None => plan.tasks.iter().map(|t| t.id.clone()).collect(),
    }
}

fn cache_outputs(
    store: &Store,
    batch: &BatchMeta,
    plan: &Plan,
    filter: &OutputFilter,
) -> Result<Option<Vec<OutputRecord>>> {
    let dir = store.lmdb_dir();
    if !dir.join("data.mdb").exists() {
        return Ok(None);
    }
    let env = open_env(&dir)?;
    let rtxn = env.read_txn()?;
    let db: Database<Str, SerdeJson<OutputRecord>> =
        match env.open_database(&rtxn, Some(DB_OUTPUTS_BY_KIND))? {
            Some(db) => db,
            None => return Ok(None),
        };

    let mut records = Vec::new();
    for task_id in task_ids(plan, filter) {
        let mut prefix = key_join(&[
            KEY_VERSION,
            &batch.snapshot_id,
            &batch.batch_id,
            &task_id,
        ]);
        prefix.push(KEY_SEP);
        if let Some(kind) = filter.kind {
            prefix.push_str(kind.as_str());
            prefix.push(KEY_SEP);
        }
        for item in db.prefix_iter(&rtxn, &prefix)? {
            let (_key, record) = item?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
    }
    records.sort_by(|a, b| a.scan_sort_key().cmp(&b.scan_sort_key()));
    Ok(Some(records))
}

fn cache_stats(
    store: &Store,
    batch: &BatchMeta,
    plan: &Plan,
    filter: &OutputFilter,
    group_by: StatsGroupBy,
) -> Result<Option<BTreeMap<String, u64>>> {
    // counters only express unfiltered groupings; otherwise aggregate the
    // cached records themselves so cache and scan stay equivalent
    if filter.kind.is_some() || filter.path.is_some() || filter.severity.is_some() {
        return Ok(cache_outputs(store, batch, plan, filter)?
            .map(|records| group_stats(&records, group_by)));
    }

    let dir = store.lmdb_dir();
    if !dir.join("data.mdb").exists() {
        return Ok(None);
    }
    let env = open_env(&dir)?;
    let rtxn = env.read_txn()?;
    let db: Database<Str, U64<BE>> = match env.open_database(&rtxn, Some(DB_STATS))? {
        Some(db) => db,
        None => return Ok(None),
    };

    let marker = match group_by {
        StatsGroupBy::Kind => "kind",
        StatsGroupBy::SeverityCode => "diag",
    };
    let mut stats = BTreeMap::new();
    for task_id in task_ids(plan, filter) {
        let mut prefix = key_join(&[
            KEY_VERSION,
            &batch.snapshot_id,
            &batch.batch_id,
            &task_id,
            marker,
        ]);
        prefix.push(KEY_SEP);
        for item in db.prefix_iter(&rtxn, &prefix)? {
            let (key, count) = item?;
            let tail: Vec<&str> = key[prefix.len()..].split(KEY_SEP).collect();
            let group = match group_by {
                StatsGroupBy::Kind => tail.first().copied().unwrap_or("unknown").to_string(),
                StatsGroupBy::SeverityCode => match tail.as_slice() {
                    [severity, code] => format!("{severity}:{code}"),
                    _ => continue,
                },
            };
            *stats.entry(group).or_insert(0) += count;
        }
    }
    Ok(Some(stats))
}
