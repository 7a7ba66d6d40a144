//! Error types for the sync core.

use std::path::PathBuf;

use nudge_scheduler::SchedulerError;
use nudge_todo::TodoError;
use thiserror::Error;

/// Errors that can occur when mutating or synchronizing reminder state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] TodoError),

    /// Writing a table to disk failed.
    #[error("failed to write {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    /// The operation targets an unknown reminder or list.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation input is malformed.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The repeat rule is malformed.
    #[error(transparent)]
    Rule(#[from] SchedulerError),
}

impl SyncError {
    /// True if the remote was unreachable and the work should be deferred.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_connectivity())
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        SyncError::Persistence {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
