//! Shard execution state machine
//!
//! ```text
//!  pending ──start──▶ running ──ok──▶ done
//!                        │
//!                        ├─err──▶ failed
//!                        │
//!                        └─reset─▶ pending   (operator action)
//! ```
//!
//! `state.json` is replaced by tmp-rename on every transition; a missing
//! file reads as `pending`. `done` and `failed` are terminal until reset.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use codebatch_store::fsio;

use crate::errors::{EngineError, Result};

pub const STATE_SCHEMA_NAME: &str = "codebatch.shard_state";
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Pending,
    Running,
    Done,
    Failed,
}

impl ShardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardState::Pending => "pending",
            ShardState::Running => "running",
            ShardState::Done => "done",
            ShardState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardState::Done | ShardState::Failed)
    }

    /// Legal transitions. `reset` (anything → pending) is the operator's
    /// escape hatch; a stale `running` may be retaken after a crash.
    pub fn can_transition(&self, to: ShardState) -> bool {
        matches!(
            (self, to),
            (ShardState::Pending, ShardState::Running)
                | (ShardState::Running, ShardState::Done)
                | (ShardState::Running, ShardState::Failed)
                | (ShardState::Running, ShardState::Running)
                | (_, ShardState::Pending)
        )
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `state.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStateFile {
    pub schema_name: String,
    pub schema_version: u32,
    pub state: ShardState,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShardStateFile {
    fn fresh(state: ShardState) -> Self {
        let now = Utc::now();
        Self {
            schema_name: STATE_SCHEMA_NAME.to_string(),
            schema_version: STATE_SCHEMA_VERSION,
            state,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Read a shard's state; a missing file is `pending`.
pub fn load_state(path: &Path) -> Result<ShardStateFile> {
    if !path.exists() {
        return Ok(ShardStateFile::fresh(ShardState::Pending));
    }
    let state: ShardStateFile = fsio::read_json(path)?;
    if state.schema_name != STATE_SCHEMA_NAME {
        return Err(EngineError::schema(format!(
            "unexpected schema {:?} in {}",
            state.schema_name,
            path.display()
        )));
    }
    Ok(state)
}

/// Transition a shard's state, enforcing the machine and writing atomically.
pub fn transition(path: &Path, to: ShardState, error: Option<String>) -> Result<ShardStateFile> {
    let current = load_state(path)?;
    if !current.state.can_transition(to) {
        return Err(EngineError::InvalidTransition {
            from: current.state.to_string(),
            to: to.to_string(),
        });
    }
    let now = Utc::now();
    let next = ShardStateFile {
        schema_name: STATE_SCHEMA_NAME.to_string(),
        schema_version: STATE_SCHEMA_VERSION,
        state: to,
        updated_at: now,
        started_at: match to {
            ShardState::Running => Some(now),
            ShardState::Pending => None,
            _ => current.started_at,
        },
        completed_at: match to {
            ShardState::Done | ShardState::Failed => Some(now),
            _ => None,
        },
        error: match to {
            ShardState::Failed => error,
            _ => None,
        },
    };
    fsio::write_json_atomic(path, &next)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_is_pending() {
        let dir = TempDir::new().unwrap();
        let state = load_state(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.state, ShardState::Pending);
    }

    #[test]
    fn test_happy_path_transitions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        transition(&path, ShardState::Running, None).unwrap();
        assert_eq!(load_state(&path).unwrap().state, ShardState::Running);

        transition(&path, ShardState::Done, None).unwrap();
        let done = load_state(&path).unwrap();
        assert_eq!(done.state, ShardState::Done);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_failure_records_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        transition(&path, ShardState::Running, None).unwrap();
        transition(&path, ShardState::Failed, Some("executor blew up".into())).unwrap();
        let failed = load_state(&path).unwrap();
        assert_eq!(failed.state, ShardState::Failed);
        assert_eq!(failed.error.as_deref(), Some("executor blew up"));
    }

    #[test]
    fn test_terminal_states_refuse_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        transition(&path, ShardState::Running, None).unwrap();
        transition(&path, ShardState::Done, None).unwrap();
        let err = transition(&path, ShardState::Running, None).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_reset_clears_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        transition(&path, ShardState::Running, None).unwrap();
        transition(&path, ShardState::Failed, Some("x".into())).unwrap();
        transition(&path, ShardState::Pending, None).unwrap();
        let state = load_state(&path).unwrap();
        assert_eq!(state.state, ShardState::Pending);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_stale_running_can_be_retaken() {
        assert!(ShardState::Running.can_transition(ShardState::Running));
        assert!(!ShardState::Pending.can_transition(ShardState::Done));
    }
}
