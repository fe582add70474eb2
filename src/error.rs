//! Error types for statharvest.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit code used when the solver environment is unusable.
///
/// Matches `EX_CONFIG` from sysexits(3) so the supervisor can tell an
/// environment failure apart from an ordinary crash.
pub const ENVIRONMENT_EXIT_CODE: i32 = 78;

/// Process exit code of a worker that stopped on SIGTERM or Ctrl+C.
///
/// The shell convention for a SIGTERM death (128 + 15). Only exit code 0
/// means the queue was drained.
pub const INTERRUPTED_EXIT_CODE: i32 = 143;

/// Main error type for statharvest.
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("{what} ({}) was not found", path.display())]
    InputNotFound { what: &'static str, path: PathBuf },

    #[error("Solver reported an error: {0}")]
    SolverRuntime(String),

    #[error("Malformed solver output: {0}")]
    Decode(String),

    #[error("Task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Worker slot {slot} crashed: {reason}")]
    ProcessCrashed { slot: usize, reason: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether the error only affects the problem being processed.
    pub fn is_per_task(&self) -> bool {
        matches!(
            self,
            Self::InputNotFound { .. } | Self::SolverRuntime(_) | Self::Decode(_)
        )
    }

    /// Exit code a worker process should use when this error ends it.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Environment(_) => ENVIRONMENT_EXIT_CODE,
            _ => 1,
        }
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::FileLockingProtocolFailed,
            ) => HarvestError::StoreUnavailable(err.to_string()),
            _ => HarvestError::Database(err),
        }
    }
}

/// Result type alias for statharvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;
