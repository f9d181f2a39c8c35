//! Batch diff engine
//!
//! Compares two batches' outputs under canonical keys, ignoring ephemeral
//! fields. Duplicate canonical keys within one batch collapse to one record
//! under the set semantics used here; regressions and improvements grade
//! diagnostics on the ordered severity scale.

use std::collections::BTreeMap;

use serde::Serialize;

use codebatch_store::Store;

use crate::cache::query_outputs;
use crate::errors::Result;
use crate::query::OutputFilter;
use crate::records::{OutputRecord, RecordKind};

/// Canonical identity of a record across runs.
///
/// Ordered segments; numeric parts are zero-padded so lexicographic order
/// matches numeric order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CanonicalKey(Vec<String>);

impl CanonicalKey {
    pub fn of(record: &OutputRecord) -> Self {
        let kind = record.kind.as_str().to_string();
        let path = record.path.clone();
        let num = |n: Option<u32>| format!("{:06}", n.unwrap_or(0));
        let opt = |s: &Option<String>| s.clone().unwrap_or_default();

        let segments = match record.kind {
            RecordKind::Diagnostic => vec![
                kind,
                path,
                num(record.line),
                num(record.column),
                opt(&record.code),
            ],
            RecordKind::Metric => vec![kind, path, opt(&record.metric)],
            RecordKind::Symbol => vec![kind, path, opt(&record.name), num(record.line)],
            RecordKind::Ast => vec![
                kind,
                path,
                record.object.map(|o| o.to_hex()).unwrap_or_default(),
            ],
            RecordKind::Edge => vec![kind, path, opt(&record.edge_type), opt(&record.target)],
            RecordKind::Other => vec![kind, path],
        };
        Self(segments)
    }
}

/// Ephemeral fields never compared: provenance and timing, not semantics.
const EPHEMERAL_FIELDS: &[&str] = &["ts", "run_id", "shard_id", "batch_id", "snapshot_id"];

/// The comparable projection of a record.
pub fn canonical_payload(record: &OutputRecord) -> serde_json::Map<String, serde_json::Value> {
    let mut value = match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    for field in EPHEMERAL_FIELDS {
        value.remove(*field);
    }
    value
}

/// A canonical key present in both batches whose payloads differ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangedPair {
    pub before: OutputRecord,
    pub after: OutputRecord,
}

/// Diff result, each list sorted by canonical key
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffReport {
    pub added: Vec<OutputRecord>,
    pub removed: Vec<OutputRecord>,
    pub changed: Vec<ChangedPair>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn keyed(records: &[OutputRecord]) -> BTreeMap<CanonicalKey, &OutputRecord> {
    let mut map = BTreeMap::new();
    for record in records {
        // duplicates within a batch collapse: first emission wins
        map.entry(CanonicalKey::of(record)).or_insert(record);
    }
    map
}

/// Compare two record sets under canonical keys.
pub fn diff_records(before: &[OutputRecord], after: &[OutputRecord]) -> DiffReport {
    let a = keyed(before);
    let b = keyed(after);

    let mut report = DiffReport::default();
    for (key, record) in &b {
        match a.get(key) {
            None => report.added.push((*record).clone()),
            Some(prev) => {
                if canonical_payload(prev) != canonical_payload(record) {
                    report.changed.push(ChangedPair {
                        before: (*prev).clone(),
                        after: (*record).clone(),
                    });
                }
            }
        }
    }
    for (key, record) in &a {
        if !b.contains_key(key) {
            report.removed.push((*record).clone());
        }
    }
    // BTreeMap iteration already yields canonical-key order
    report
}

/// Diff two batches' complete outputs (read through the query router).
pub fn diff_batches(store: &Store, batch_a: &str, batch_b: &str) -> Result<DiffReport> {
    let before = query_outputs(store, batch_a, &OutputFilter::default())?;
    let after = query_outputs(store, batch_b, &OutputFilter::default())?;
    Ok(diff_records(&before, &after))
}

fn severity_worsened(pair: &ChangedPair) -> bool {
    match (pair.before.severity, pair.after.severity) {
        (Some(before), Some(after)) => after > before,
        _ => false,
    }
}

/// New diagnostics plus severity-worsened changes.
pub fn regressions(report: &DiffReport) -> Vec<OutputRecord> {
    let mut records: Vec<OutputRecord> = report
        .added
        .iter()
        .filter(|r| r.kind == RecordKind::Diagnostic)
        .cloned()
        .collect();
    records.extend(
        report
            .changed
            .iter()
            .filter(|pair| pair.after.kind == RecordKind::Diagnostic && severity_worsened(pair))
            .map(|pair| pair.after.clone()),
    );
    records.sort_by(|a, b| CanonicalKey::of(a).cmp(&CanonicalKey::of(b)));
    records
}

/// Removed diagnostics plus severity-improved changes.
pub fn improvements(report: &DiffReport) -> Vec<OutputRecord> {
    let mut records: Vec<OutputRecord> = report
        .removed
        .iter()
        .filter(|r| r.kind == RecordKind::Diagnostic)
        .cloned()
        .collect();
    records.extend(
        report
            .changed
            .iter()
            .filter(|pair| {
                pair.after.kind == RecordKind::Diagnostic
                    && match (pair.before.severity, pair.after.severity) {
                        (Some(before), Some(after)) => after < before,
                        _ => false,
                    }
            })
            .map(|pair| pair.after.clone()),
    );
    records.sort_by(|a, b| CanonicalKey::of(a).cmp(&CanonicalKey::of(b)));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{OutputDraft, RecordHeader, Severity};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn header(batch: &str) -> RecordHeader {
        RecordHeader {
            snapshot_id: "snap".into(),
            batch_id: batch.into(),
            task_id: "lint".into(),
            shard_id: "0".into(),
            ts: Utc::now(),
        }
    }

    fn diag(batch: &str, path: &str, code: &str, line: u32, severity: Severity) -> OutputRecord {
        OutputDraft::diagnostic(path, severity, code, format!("msg {code}"), line, 1)
            .into_record(&header(batch))
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let a = vec![diag("a", "m.py", "L101", 1, Severity::Warning)];
        let b = vec![diag("b", "m.py", "L101", 1, Severity::Warning)];
        // batch_id and ts differ, both are ephemeral
        let report = diff_records(&a, &b);
        assert!(report.is_empty());
    }

    #[test]
    fn test_diff_added_and_removed() {
        let a = vec![diag("a", "m.py", "L101", 1, Severity::Warning)];
        let b = vec![diag("b", "m.py", "L102", 3, Severity::Warning)];
        let report = diff_records(&a, &b);
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.added[0].code.as_deref(), Some("L102"));
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].code.as_deref(), Some("L101"));
        assert!(report.changed.is_empty());
    }

    #[test]
    fn test_diff_changed_on_payload_difference() {
        let a = vec![diag("a", "m.py", "L101", 1, Severity::Warning)];
        let mut worse = diag("b", "m.py", "L101", 1, Severity::Error);
        worse.message = Some("msg L101".into());
        let report = diff_records(&a, &[worse]);
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(report.changed.len(), 1);
    }

    #[test]
    fn test_duplicates_collapse() {
        let a = vec![
            diag("a", "m.py", "L101", 1, Severity::Warning),
            diag("a", "m.py", "L101", 1, Severity::Warning),
        ];
        let b = vec![diag("b", "m.py", "L101", 1, Severity::Warning)];
        let report = diff_records(&a, &b);
        assert!(report.is_empty());
    }

    #[test]
    fn test_regressions_from_added_diagnostic() {
        let a: Vec<OutputRecord> = vec![];
        let b = vec![diag("b", "m.py", "L101", 1, Severity::Warning)];
        let report = diff_records(&a, &b);
        let regs = regressions(&report);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].code.as_deref(), Some("L101"));
        assert!(improvements(&report).is_empty());
    }

    #[test]
    fn test_regressions_from_worsened_severity() {
        let a = vec![diag("a", "m.py", "L101", 1, Severity::Warning)];
        let b = vec![diag("b", "m.py", "L101", 1, Severity::Error)];
        let report = diff_records(&a, &b);
        assert_eq!(regressions(&report).len(), 1);
        assert!(improvements(&report).is_empty());
    }

    #[test]
    fn test_improvements_mirror() {
        let a = vec![diag("a", "m.py", "L101", 1, Severity::Error)];
        let b = vec![diag("b", "m.py", "L101", 1, Severity::Warning)];
        let report = diff_records(&a, &b);
        assert!(regressions(&report).is_empty());
        assert_eq!(improvements(&report).len(), 1);
    }

    #[test]
    fn test_metric_key_ignores_value_for_identity() {
        let header_a = header("a");
        let header_b = header("b");
        let before = OutputDraft::metric("m.py", "complexity", 1.0).into_record(&header_a);
        let after = OutputDraft::metric("m.py", "complexity", 5.0).into_record(&header_b);
        let report = diff_records(&[before], &[after]);
        assert_eq!(report.changed.len(), 1);
        assert!(report.added.is_empty());
    }
}
