//! Audit ledger storage.
//!
//! A single SQLite file holds every transfer attempt. The [`AuditLedger`]
//! wraps the repository layer with startup integrity checks, bounded write
//! retries with store reconnects, retention, and orphan reclamation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

pub mod error;
pub mod ledger;
pub mod models;
pub mod repositories;

pub use error::LedgerError;
pub use ledger::{AuditLedger, LedgerConfig, StartupReport};

pub type DbPool = sqlx::SqlitePool;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema for the ledger. Idempotent.
const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS transfer_attempts ( \
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        session_id TEXT NOT NULL, \
        timestamp TEXT NOT NULL, \
        file_name TEXT NOT NULL, \
        source_path TEXT NOT NULL, \
        destination_path TEXT NOT NULL, \
        rule_name TEXT NOT NULL, \
        file_size INTEGER NOT NULL, \
        status TEXT NOT NULL, \
        error_message TEXT, \
        attempt_count INTEGER NOT NULL DEFAULT 0 \
    ); \
    CREATE INDEX IF NOT EXISTS idx_transfer_attempts_timestamp \
        ON transfer_attempts (timestamp); \
    CREATE INDEX IF NOT EXISTS idx_transfer_attempts_status \
        ON transfer_attempts (status, session_id);";

/// Create a connection pool for the ledger file at `path`.
///
/// The file is created if missing. WAL journaling with `synchronous=FULL`
/// makes every committed write durable before the call returns.
pub async fn create_pool(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite:")?
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
}

/// Run SQLite's structural integrity check.
///
/// Returns `Ok(true)` when the store reports `ok`.
pub async fn integrity_check(pool: &DbPool) -> Result<bool, sqlx::Error> {
    let result: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(pool)
        .await?;
    Ok(result.eq_ignore_ascii_case("ok"))
}

/// Create the ledger table and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
