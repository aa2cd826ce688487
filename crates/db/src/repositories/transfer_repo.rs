//! Repository for the `transfer_attempts` table.

use ferry_core::transfer::{
    NewTransferAttempt, TransferAttempt, TransferOutcome, TransferStatus, INTERRUPTED_ERROR,
};
use ferry_core::types::{DbId, Timestamp};
use sqlx::SqlitePool;

use crate::models::transfer::TransferAttemptRow;

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

/// Column list for `transfer_attempts` SELECT queries.
const COLUMNS: &str = "\
    id, session_id, timestamp, file_name, source_path, destination_path, \
    rule_name, file_size, status, error_message, attempt_count";

/// Column list for INSERT (excludes auto-generated `id`).
const INSERT_COLUMNS: &str = "\
    session_id, timestamp, file_name, source_path, destination_path, \
    rule_name, file_size, status, error_message, attempt_count";

// ---------------------------------------------------------------------------
// TransferRepo
// ---------------------------------------------------------------------------

/// Provides insert, update, and maintenance queries for transfer attempts.
pub struct TransferRepo;

impl TransferRepo {
    /// Insert a new attempt and return its id.
    pub async fn insert(
        pool: &SqlitePool,
        session_id: &str,
        timestamp: Timestamp,
        attempt: &NewTransferAttempt,
    ) -> Result<DbId, sqlx::Error> {
        let query = format!(
            "INSERT INTO transfer_attempts ({INSERT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let result = sqlx::query(&query)
            .bind(session_id)
            .bind(timestamp)
            .bind(&attempt.file_name)
            .bind(&attempt.source_path)
            .bind(&attempt.destination_path)
            .bind(&attempt.rule_name)
            .bind(attempt.file_size)
            .bind(attempt.status.as_str())
            .bind(&attempt.error_message)
            .bind(attempt.attempt_count)
            .execute(pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Write the final outcome over an `InProgress` row.
    ///
    /// Returns `false` if the row does not exist or was already final, so
    /// the `InProgress -> final` transition happens at most once.
    pub async fn complete(
        pool: &SqlitePool,
        id: DbId,
        outcome: &TransferOutcome,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfer_attempts \
             SET status = ?, error_message = ?, attempt_count = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(outcome.status.as_str())
        .bind(&outcome.error_message)
        .bind(outcome.attempt_count)
        .bind(id)
        .bind(TransferStatus::InProgress.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Find a single attempt by id.
    pub async fn find_by_id(
        pool: &SqlitePool,
        id: DbId,
    ) -> Result<Option<TransferAttempt>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM transfer_attempts WHERE id = ?");
        let row = sqlx::query_as::<_, TransferAttemptRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(TransferAttempt::from))
    }

    /// Newest-first listing, optionally restricted to one session.
    pub async fn list_recent(
        pool: &SqlitePool,
        limit: i64,
        session_id: Option<&str>,
    ) -> Result<Vec<TransferAttempt>, sqlx::Error> {
        let rows = match session_id {
            Some(session) => {
                let query = format!(
                    "SELECT {COLUMNS} FROM transfer_attempts WHERE session_id = ? \
                     ORDER BY id DESC LIMIT ?"
                );
                sqlx::query_as::<_, TransferAttemptRow>(&query)
                    .bind(session)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
            None => {
                let query =
                    format!("SELECT {COLUMNS} FROM transfer_attempts ORDER BY id DESC LIMIT ?");
                sqlx::query_as::<_, TransferAttemptRow>(&query)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(TransferAttempt::from).collect())
    }

    /// Total number of rows.
    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM transfer_attempts")
            .fetch_one(pool)
            .await
    }

    /// Rewrite `InProgress` rows left by other sessions to `Failed`.
    pub async fn reclaim_orphans(
        pool: &SqlitePool,
        current_session: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfer_attempts SET status = ?, error_message = ? \
             WHERE status = ? AND session_id <> ?",
        )
        .bind(TransferStatus::Failed.as_str())
        .bind(INTERRUPTED_ERROR)
        .bind(TransferStatus::InProgress.as_str())
        .bind(current_session)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete rows older than `cutoff`.
    pub async fn delete_older_than(
        pool: &SqlitePool,
        cutoff: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM transfer_attempts WHERE timestamp < ? AND status <> ?")
            .bind(cutoff)
            .bind(TransferStatus::InProgress.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keep only the newest `max_rows` rows. `InProgress` rows are never
    /// truncated.
    pub async fn truncate_to(pool: &SqlitePool, max_rows: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM transfer_attempts WHERE status <> ? AND id IN ( \
                 SELECT id FROM transfer_attempts ORDER BY id DESC LIMIT -1 OFFSET ? \
             )",
        )
        .bind(TransferStatus::InProgress.as_str())
        .bind(max_rows)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete every finished row, keeping only `InProgress` ones.
    pub async fn delete_finished(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM transfer_attempts WHERE status <> ?")
            .bind(TransferStatus::InProgress.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
