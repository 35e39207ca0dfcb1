//! Error taxonomy for scans, cleanups and backups
//!
//! Stage-level failures propagate as [`SweepError`]. Item-level failures are
//! collected into result structures and never returned through `?`.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, SweepError>;

/// Errors surfaced by engine stages
#[derive(Debug, Error)]
pub enum SweepError {
    /// Bad configuration or user input, rejected before any action
    #[error("validation failed: {0}")]
    Validation(String),

    /// A root or target path cannot be read or written
    #[error("cannot access {}: {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The stage stopped because its cancellation token fired
    #[error("{stage} stopped by cancellation")]
    Cancelled { stage: String },

    /// Some items failed while the batch carried on
    #[error("{failed} of {total} operations failed")]
    PartialOperation { failed: usize, total: usize },

    /// A hard safety rule was hit; remaining work in the run was abandoned
    #[error("safety violation: {0}")]
    Safety(#[from] SafetyViolation),

    #[error("backup error: {0}")]
    Backup(String),

    /// A stage worker panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    /// Build an access error for a path
    pub fn access(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SweepError::Access {
            path: path.into(),
            source,
        }
    }

    /// Build a cancellation error for a named stage
    pub fn cancelled(stage: impl Into<String>) -> Self {
        SweepError::Cancelled {
            stage: stage.into(),
        }
    }

    /// Whether this error means "stopped" rather than "broken"
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SweepError::Cancelled { .. })
    }
}

/// Breach of a cleaner safety invariant
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyViolation {
    #[error("{} is not an absolute path free of '..'", path.display())]
    UnsafePath { path: PathBuf },

    #[error("{} resolves inside protected path {}", path.display(), protected.display())]
    ProtectedPath { path: PathBuf, protected: PathBuf },

    #[error("{} is only {depth} levels deep (minimum {min_depth})", path.display())]
    TooShallow {
        path: PathBuf,
        depth: usize,
        min_depth: usize,
    },

    #[error("deleting {attempted} bytes would exceed the {cap} byte cap")]
    SizeCapExceeded { attempted: u64, cap: u64 },
}
