//! Transfer attempt rows.

use ferry_core::transfer::{TransferAttempt, TransferStatus};
use ferry_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A `transfer_attempts` row as stored.
///
/// Converted into the domain [`TransferAttempt`] before leaving the crate.
#[derive(Debug, Clone, FromRow)]
pub struct TransferAttemptRow {
    pub id: DbId,
    pub session_id: String,
    pub timestamp: Timestamp,
    pub file_name: String,
    pub source_path: String,
    pub destination_path: String,
    pub rule_name: String,
    pub file_size: i64,
    #[sqlx(try_from = "String")]
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub attempt_count: i64,
}

impl From<TransferAttemptRow> for TransferAttempt {
    fn from(row: TransferAttemptRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            timestamp: row.timestamp,
            file_name: row.file_name,
            source_path: row.source_path,
            destination_path: row.destination_path,
            rule_name: row.rule_name,
            file_size: row.file_size,
            status: row.status,
            error_message: row.error_message,
            attempt_count: row.attempt_count,
        }
    }
}
