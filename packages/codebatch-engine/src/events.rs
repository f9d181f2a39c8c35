//! Observability event stream
//!
//! `events.jsonl` is append-only and non-authoritative: nothing in the
//! substrate ever reads it back, and a lost event loses no truth. Write
//! failures are logged and swallowed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

pub const EVENT_SCHEMA_NAME: &str = "codebatch.event";
pub const EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
pub struct Event<'a> {
    pub schema_name: &'static str,
    pub schema_version: u32,
    pub ts: DateTime<Utc>,
    pub event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

/// Shared append-only writer; safe across the worker pool.
pub struct EventWriter {
    file: Mutex<File>,
}

impl EventWriter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event. Failures are logged, never raised.
    pub fn emit(&self, event: &str, task_id: Option<&str>, shard_id: Option<&str>, detail: Option<&str>) {
        let record = Event {
            schema_name: EVENT_SCHEMA_NAME,
            schema_version: EVENT_SCHEMA_VERSION,
            ts: Utc::now(),
            event,
            task_id,
            shard_id,
            detail,
        };
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "event serialization failed");
                return;
            }
        };
        line.push(b'\n');
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(&line) {
            warn!(error = %e, "event write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let writer = EventWriter::open(&path).unwrap();
        writer.emit("shard_started", Some("parse"), Some("0a"), None);
        writer.emit("shard_completed", Some("parse"), Some("0a"), Some("3 records"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("shard_started"));
        assert!(lines[1].contains("3 records"));
    }
}
