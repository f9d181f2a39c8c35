//! Output record model
//!
//! Output records are a tagged variant by `kind` with a shared header. The
//! runner stamps the header (`ts`, `snapshot_id`, `batch_id`, `task_id`,
//! `shard_id`); executors only produce drafts. Writers emit registered
//! fields only; readers tolerate unknown ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use codebatch_store::{path_key_of, ObjectHash};

use crate::errors::{EngineError, Result};

pub const OUTPUT_SCHEMA_NAME: &str = "codebatch.output";
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// Diagnostic severity, ordered `info < warning < error`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            _ => Err(EngineError::schema(format!("unknown severity: {s:?}"))),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Diagnostic,
    Metric,
    Symbol,
    Ast,
    Edge,
    #[serde(other)]
    Other,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Diagnostic => "diagnostic",
            RecordKind::Metric => "metric",
            RecordKind::Symbol => "symbol",
            RecordKind::Ast => "ast",
            RecordKind::Edge => "edge",
            RecordKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "diagnostic" => Ok(RecordKind::Diagnostic),
            "metric" => Ok(RecordKind::Metric),
            "symbol" => Ok(RecordKind::Symbol),
            "ast" => Ok(RecordKind::Ast),
            "edge" => Ok(RecordKind::Edge),
            _ => Ok(RecordKind::Other),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of a shard's `outputs.index.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub schema_name: String,
    pub schema_version: u32,
    pub snapshot_id: String,
    pub batch_id: String,
    pub task_id: String,
    pub shard_id: String,
    pub path: String,
    pub kind: RecordKind,
    pub ts: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    // diagnostic payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,

    // symbol payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    // metric payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    // edge payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    // tolerated when foreign writers stamp it; never emitted by this runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl OutputRecord {
    /// Canonical ordering key for query listings:
    /// `(path_key, kind, line, column, code)`
    pub fn scan_sort_key(&self) -> (String, &'static str, u32, u32, String) {
        (
            path_key_of(&self.path),
            self.kind.as_str(),
            self.line.unwrap_or(0),
            self.column.unwrap_or(0),
            self.code.clone().unwrap_or_default(),
        )
    }
}

/// A record as produced by an executor, before the runner stamps the header.
#[derive(Debug, Clone, Default)]
pub struct OutputDraft {
    pub path: String,
    pub kind: Option<RecordKind>,
    pub object: Option<ObjectHash>,
    pub format: Option<String>,
    pub severity: Option<Severity>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub name: Option<String>,
    pub symbol_type: Option<String>,
    pub scope: Option<String>,
    pub metric: Option<String>,
    pub value: Option<f64>,
    pub edge_type: Option<String>,
    pub target: Option<String>,
}

impl OutputDraft {
    pub fn diagnostic(
        path: impl Into<String>,
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        Self {
            path: path.into(),
            kind: Some(RecordKind::Diagnostic),
            severity: Some(severity),
            code: Some(code.into()),
            message: Some(message.into()),
            line: Some(line),
            column: Some(column),
            ..Default::default()
        }
    }

    pub fn metric(path: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            path: path.into(),
            kind: Some(RecordKind::Metric),
            metric: Some(metric.into()),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn symbol(
        path: impl Into<String>,
        name: impl Into<String>,
        symbol_type: impl Into<String>,
        scope: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            path: path.into(),
            kind: Some(RecordKind::Symbol),
            name: Some(name.into()),
            symbol_type: Some(symbol_type.into()),
            scope: Some(scope.into()),
            line: Some(line),
            ..Default::default()
        }
    }

    pub fn ast(path: impl Into<String>, object: ObjectHash, format: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: Some(RecordKind::Ast),
            object: Some(object),
            format: Some(format.into()),
            ..Default::default()
        }
    }

    pub fn edge(
        path: impl Into<String>,
        edge_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind: Some(RecordKind::Edge),
            edge_type: Some(edge_type.into()),
            target: Some(target.into()),
            ..Default::default()
        }
    }

    /// Check kind-specific required fields before serialization.
    pub fn validate(&self) -> Result<()> {
        let kind = self
            .kind
            .ok_or_else(|| EngineError::schema(format!("record for {:?} has no kind", self.path)))?;
        if self.path.is_empty() {
            return Err(EngineError::schema("record has empty path"));
        }
        let missing = |field: &str| {
            EngineError::schema(format!(
                "{} record for {:?} missing required field {field}",
                kind, self.path
            ))
        };
        match kind {
            RecordKind::Diagnostic => {
                if self.severity.is_none() {
                    return Err(missing("severity"));
                }
                if self.code.is_none() {
                    return Err(missing("code"));
                }
                if self.message.is_none() {
                    return Err(missing("message"));
                }
                if self.line.is_none() {
                    return Err(missing("line"));
                }
            }
            RecordKind::Metric => {
                if self.metric.is_none() {
                    return Err(missing("metric"));
                }
                if self.value.is_none() {
                    return Err(missing("value"));
                }
            }
            RecordKind::Symbol => {
                if self.name.is_none() {
                    return Err(missing("name"));
                }
                if self.symbol_type.is_none() {
                    return Err(missing("symbol_type"));
                }
                if self.line.is_none() {
                    return Err(missing("line"));
                }
            }
            RecordKind::Ast => {
                if self.object.is_none() {
                    return Err(missing("object"));
                }
            }
            RecordKind::Edge => {
                if self.edge_type.is_none() {
                    return Err(missing("edge_type"));
                }
                if self.target.is_none() {
                    return Err(missing("target"));
                }
            }
            RecordKind::Other => {}
        }
        Ok(())
    }

    /// Stamp the shared header, consuming the draft.
    pub fn into_record(self, header: &RecordHeader) -> OutputRecord {
        OutputRecord {
            schema_name: OUTPUT_SCHEMA_NAME.to_string(),
            schema_version: OUTPUT_SCHEMA_VERSION,
            snapshot_id: header.snapshot_id.clone(),
            batch_id: header.batch_id.clone(),
            task_id: header.task_id.clone(),
            shard_id: header.shard_id.clone(),
            path: self.path,
            kind: self.kind.unwrap_or(RecordKind::Other),
            ts: header.ts,
            object: self.object,
            format: self.format,
            severity: self.severity,
            code: self.code,
            message: self.message,
            line: self.line,
            column: self.column,
            name: self.name,
            symbol_type: self.symbol_type,
            scope: self.scope,
            metric: self.metric,
            value: self.value,
            edge_type: self.edge_type,
            target: self.target,
            run_id: None,
        }
    }
}

/// Header fields stamped by the runner
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub snapshot_id: String,
    pub batch_id: String,
    pub task_id: String,
    pub shard_id: String,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn test_severity_serde() {
        assert_eq!(
            serde_json::to_string(&Severity::Warning).unwrap(),
            "\"warning\""
        );
        let back: Severity = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(back, Severity::Error);
    }

    #[test]
    fn test_kind_unknown_deserializes_to_other() {
        let kind: RecordKind = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(kind, RecordKind::Other);
    }

    #[test]
    fn test_diagnostic_validation() {
        let good = OutputDraft::diagnostic("a.py", Severity::Warning, "L101", "msg", 1, 1);
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.code = None;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_metric_validation() {
        let good = OutputDraft::metric("a.py", "complexity", 1.0);
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.value = None;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_record_omits_empty_payload_fields() {
        let header = RecordHeader {
            snapshot_id: "s".into(),
            batch_id: "b".into(),
            task_id: "t".into(),
            shard_id: "00".into(),
            ts: Utc::now(),
        };
        let record =
            OutputDraft::metric("a.py", "complexity", 1.0).into_record(&header);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("severity").is_none());
        assert!(json.get("edge_type").is_none());
        assert_eq!(json["metric"], "complexity");
    }

    #[test]
    fn test_scan_sort_key_uses_path_key() {
        let header = RecordHeader {
            snapshot_id: "s".into(),
            batch_id: "b".into(),
            task_id: "t".into(),
            shard_id: "00".into(),
            ts: Utc::now(),
        };
        let record = OutputDraft::diagnostic("Src/A.py", Severity::Info, "X1", "m", 3, 2)
            .into_record(&header);
        let key = record.scan_sort_key();
        assert_eq!(key.0, "src/a.py");
        assert_eq!(key.1, "diagnostic");
        assert_eq!(key.2, 3);
    }
}
