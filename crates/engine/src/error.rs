//! Engine error type.

use std::path::PathBuf;

use ferry_core::error::CoreError;
use ferry_core::status::ErrorReason;
use ferry_db::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A rule's source folder could not be listed.
    #[error("Cannot scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted state file could not be read or written.
    #[error("State store error at {path}: {message}")]
    State { path: PathBuf, message: String },

    /// The orchestrator is in error mode; a restart is required.
    #[error("Halted: {}", .0.describe())]
    Halted(ErrorReason),

    #[error("Orchestrator already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
