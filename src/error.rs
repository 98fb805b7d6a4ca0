//! Error taxonomy for the escalation orchestrator.
//!
//! Mirrors the semantic categories in spec.md §7, not a generic catch-all:
//! each variant corresponds to a distinct recovery policy at the call site.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type EscalateResult<T> = Result<T, EscalateError>;

/// Errors that can occur while operating the orchestrator.
#[derive(Error, Debug)]
pub enum EscalateError {
    /// Bad array spec, missing script, malformed config. Fails the `submit`
    /// invocation before any chain is created.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// A scheduler command failed to parse even after retries. Fatal to the
    /// current round/handler.
    #[error("scheduler error: {0}")]
    SchedulerFatal(String),

    /// Checkpoint could not be read or written. Fatal to the current
    /// handler invocation — the checkpoint is never silently rewritten on a
    /// parse failure.
    #[error("checkpoint error at {path:?}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    /// A chain id was requested that has no checkpoint on disk.
    #[error("chain not found: {0}")]
    ChainNotFound(String),

    /// I/O failure not otherwise categorized.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EscalateError {
    pub fn checkpoint(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Fill in the checkpoint path on an error raised by the format parser,
    /// which has no path of its own to report.
    pub fn with_checkpoint_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Checkpoint { message, .. } => Self::Checkpoint {
                path: path.into(),
                message,
            },
            other => other,
        }
    }

    /// CLI exit code for this error category, per spec.md §6's table: 0 on
    /// success, non-zero on usage errors, and submission itself returns 0
    /// once a chain is registered regardless of downstream outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UserInput(_) => 2,
            Self::ChainNotFound(_) => 3,
            Self::SchedulerFatal(_) => 4,
            Self::Checkpoint { .. } => 5,
            Self::Io(_) => 1,
        }
    }
}
