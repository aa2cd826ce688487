use ferry_core::types::DbId;

/// Primary SQLite result codes that mean the file itself is damaged.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Errors surfaced by the audit ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A query failed after all retries.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Backing up or recreating the store failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ledger exhausted its write retries and refuses further writes.
    #[error("Audit ledger is disabled")]
    Disabled,

    /// An update targeted a row that is not `InProgress`.
    #[error("Transfer attempt {0} is not in progress")]
    NotInProgress(DbId),

    /// The store is unusable even after being recreated.
    #[error("Audit store is corrupt: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Whether the store file is damaged, as opposed to busy, locked or
    /// unreadable. Only a damaged store may be moved aside and recreated.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corrupt(_) => true,
            Self::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_CORRUPT | SQLITE_NOTADB)),
            _ => false,
        }
    }
}
