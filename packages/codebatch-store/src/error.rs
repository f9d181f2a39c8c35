//! Error types for codebatch-store

use std::fmt;
use thiserror::Error;

/// Store error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store root missing or not initialized
    StoreNotFound,
    /// Store root exists but `store.json` is malformed
    StoreInvalid,
    /// Snapshot not found
    SnapshotNotFound,
    /// Object integrity check failed
    CasCorrupt,
    /// Two input paths normalize to the same `path_key`
    PathCollision,
    /// Raw path rejected by normalization rules
    InvalidPath,
    /// Symlink cycle encountered during the snapshot walk
    SymlinkLoop,
    /// Another process holds the store write lock
    Locked,
    /// Serialization/deserialization errors
    Serialization,
    /// I/O errors
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreNotFound => "store_not_found",
            ErrorKind::StoreInvalid => "store_invalid",
            ErrorKind::SnapshotNotFound => "snapshot_not_found",
            ErrorKind::CasCorrupt => "cas_corrupt",
            ErrorKind::PathCollision => "path_collision",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::SymlinkLoop => "symlink_loop",
            ErrorKind::Locked => "locked",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StoreError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn store_not_found(root: impl fmt::Display) -> Self {
        Self::new(ErrorKind::StoreNotFound, format!("no store at {}", root))
    }

    pub fn store_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreInvalid, message)
    }

    pub fn snapshot_not_found(snapshot_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SnapshotNotFound,
            format!("snapshot not found: {}", snapshot_id.into()),
        )
    }

    pub fn cas_corrupt(expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorKind::CasCorrupt,
            format!("object hash mismatch: expected {expected}, got {actual}"),
        )
    }

    pub fn path_collision(a: &str, b: &str, key: &str) -> Self {
        Self::new(
            ErrorKind::PathCollision,
            format!("paths {a:?} and {b:?} collide on key {key:?}"),
        )
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Locked, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::io(format!("I/O error: {}", err)).with_source(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::new(ErrorKind::Serialization, format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
