//! Error types for codebatch-engine
//!
//! Every error maps to a stable machine code (`code()`) and a CLI exit class
//! (`exit_code()`); the CLI renders either a human line or the structured
//! envelope.

use serde::Serialize;
use thiserror::Error;

use codebatch_store::{ErrorKind as StoreErrorKind, StoreError};

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage-layer error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// LMDB cache error
    #[error("cache error: {0}")]
    Lmdb(#[from] heed::Error),

    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// Task not found in the batch plan
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Plan validation error
    #[error("invalid plan: {0}")]
    Plan(String),

    /// A task's dependency has not completed for this shard
    #[error("deps unsatisfied: task {task} shard {shard} waits on {dep}")]
    DepsUnsatisfied {
        task: String,
        dep: String,
        shard: String,
    },

    /// Executor raised or emitted an invalid record
    #[error("executor failed: task {task} shard {shard}: {message}")]
    ExecutorFailed {
        task: String,
        shard: String,
        message: String,
    },

    /// Illegal shard state transition
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Persisted record violates its schema
    #[error("schema error: {0}")]
    Schema(String),

    /// Cooperative cancellation observed
    #[error("cancelled")]
    Cancelled,

    /// Anything unexpected
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        EngineError::Schema(msg.into())
    }

    pub fn plan(msg: impl Into<String>) -> Self {
        EngineError::Plan(msg.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Json(_) => "SCHEMA_ERROR",
            EngineError::Store(e) => match e.kind {
                StoreErrorKind::StoreNotFound => "STORE_NOT_FOUND",
                StoreErrorKind::StoreInvalid => "STORE_INVALID",
                StoreErrorKind::SnapshotNotFound => "SNAPSHOT_NOT_FOUND",
                StoreErrorKind::CasCorrupt => "CAS_CORRUPT",
                StoreErrorKind::PathCollision => "PATH_COLLISION",
                StoreErrorKind::InvalidPath => "INVALID_PATH",
                StoreErrorKind::SymlinkLoop => "SYMLINK_LOOP",
                StoreErrorKind::Locked => "STORE_LOCKED",
                StoreErrorKind::Serialization => "SCHEMA_ERROR",
                StoreErrorKind::Io => "IO_ERROR",
            },
            EngineError::Lmdb(_) => "CACHE_ERROR",
            EngineError::BatchNotFound(_) => "BATCH_NOT_FOUND",
            EngineError::TaskNotFound(_) => "TASK_NOT_FOUND",
            EngineError::Plan(_) => "PLAN_INVALID",
            EngineError::DepsUnsatisfied { .. } => "DEPS_UNSATISFIED",
            EngineError::ExecutorFailed { .. } => "EXECUTOR_FAILED",
            EngineError::InvalidTransition { .. } => "INTERNAL_ERROR",
            EngineError::Schema(_) => "SCHEMA_ERROR",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// CLI exit class: 2 = bad invocation/missing store, 3 = internal, 1 = expected failure
    pub fn exit_code(&self) -> i32 {
        match self.code() {
            "STORE_NOT_FOUND" | "STORE_INVALID" | "STORE_LOCKED" => 2,
            "INTERNAL_ERROR" => 3,
            _ => 1,
        }
    }

    /// Operator hints included in the structured envelope
    pub fn hints(&self) -> Vec<String> {
        match self {
            EngineError::Store(e) if e.kind == StoreErrorKind::StoreNotFound => {
                vec!["run `codebatch init <store>` first".to_string()]
            }
            EngineError::DepsUnsatisfied { dep, .. } => {
                vec![format!("run task {dep} to completion first")]
            }
            EngineError::ExecutorFailed { task, shard, .. } => {
                vec![format!("re-run with `run-shard --task {task} --shard {shard}`")]
            }
            _ => vec![],
        }
    }
}

/// Structured error envelope for `--json` output
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub hints: Vec<String>,
    pub details: serde_json::Value,
}

impl ErrorEnvelope {
    pub fn from_error(err: &EngineError) -> Self {
        Self {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                hints: err.hints(),
                details: serde_json::Value::Null,
            },
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
