//! Durable, session-scoped record of transfer attempts.
//!
//! [`AuditLedger`] is the accountability boundary of the service: a move
//! may only start once its `InProgress` row has been written. Writes are
//! retried a bounded number of times, reopening the store between attempts;
//! once retries are exhausted the ledger disables itself and every further
//! write fails fast so callers can block transfers instead of proceeding
//! unrecorded.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use ferry_core::transfer::{NewTransferAttempt, TransferAttempt, TransferOutcome};
use ferry_core::types::DbId;
use tokio::sync::RwLock;

use crate::error::LedgerError;
use crate::repositories::TransferRepo;
use crate::{create_pool, ensure_schema, integrity_check, DbPool};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retention and retry tuning for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Purge rows older than this many days at startup.
    pub retention_days: Option<u32>,
    /// Keep at most this many rows; checked after each insert.
    pub max_rows: Option<i64>,
    /// Attempts per write before the ledger disables itself.
    pub write_retries: u32,
    /// Pause between write attempts.
    pub retry_delay: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_days: Some(90),
            max_rows: Some(100_000),
            write_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// What happened while opening and maintaining the store at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Where the corrupt store was moved, if it had to be recreated.
    pub backup_path: Option<PathBuf>,
    /// `InProgress` rows from earlier sessions rewritten to `Failed`.
    pub orphans_reclaimed: u64,
    /// Rows removed by the age cap.
    pub purged: u64,
}

// ---------------------------------------------------------------------------
// AuditLedger
// ---------------------------------------------------------------------------

pub struct AuditLedger {
    path: PathBuf,
    session_id: String,
    config: LedgerConfig,
    pool: RwLock<DbPool>,
    enabled: AtomicBool,
    backup_path: Option<PathBuf>,
}

impl AuditLedger {
    /// Open (or create) the store at `path` for the given session.
    ///
    /// A store that fails SQLite's integrity check, or that SQLite reports
    /// as corrupt or not a database, is moved aside and a fresh one is
    /// created in its place. Any other failure (busy, locked, permissions)
    /// is returned and the file is left untouched.
    pub async fn open(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let (pool, backup_path) = match open_verified(&path).await {
            Ok(pool) => (pool, None),
            Err(e) if existed && e.is_corruption() => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Audit store failed integrity check, recreating",
                );
                let backup = backup_corrupt_store(&path).await?;
                let pool = open_verified(&path)
                    .await
                    .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
                (pool, Some(backup))
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Audit store could not be opened");
                return Err(e);
            }
        };

        tracing::info!(path = %path.display(), "Audit ledger opened");

        Ok(Self {
            path,
            session_id: session_id.into(),
            config,
            pool: RwLock::new(pool),
            enabled: AtomicBool::new(true),
            backup_path,
        })
    }

    /// Reclaim orphaned rows and apply the age cap.
    ///
    /// Called once by the orchestrator before any rule starts.
    pub async fn startup_maintenance(&self) -> Result<StartupReport, LedgerError> {
        let pool = self.pool.read().await.clone();

        let orphans_reclaimed = TransferRepo::reclaim_orphans(&pool, &self.session_id).await?;
        if orphans_reclaimed > 0 {
            tracing::warn!(
                count = orphans_reclaimed,
                "Reclassified interrupted transfers from a previous session as failed",
            );
        }

        let purged = match self.config.retention_days {
            Some(days) => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
                TransferRepo::delete_older_than(&pool, cutoff).await?
            }
            None => 0,
        };
        if purged > 0 {
            tracing::info!(purged, "Ledger retention: purged old rows");
        }

        Ok(StartupReport {
            backup_path: self.backup_path.clone(),
            orphans_reclaimed,
            purged,
        })
    }

    /// Durably record a new attempt and return its id.
    pub async fn record(&self, attempt: &NewTransferAttempt) -> Result<DbId, LedgerError> {
        let session = self.session_id.as_str();
        let now = Utc::now();
        let id = self
            .with_write_retry("record", |pool| async move {
                TransferRepo::insert(&pool, session, now, attempt).await
            })
            .await?;

        if let Some(max_rows) = self.config.max_rows {
            let pool = self.pool.read().await.clone();
            match TransferRepo::truncate_to(&pool, max_rows).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Ledger retention: truncated oldest rows"),
                Err(e) => tracing::warn!(error = %e, "Ledger retention: truncation failed"),
            }
        }

        tracing::debug!(
            id,
            file = %attempt.file_name,
            rule = %attempt.rule_name,
            status = %attempt.status,
            "Ledger row recorded",
        );
        Ok(id)
    }

    /// Write the final status of an `InProgress` attempt.
    pub async fn update(&self, id: DbId, outcome: &TransferOutcome) -> Result<(), LedgerError> {
        let updated = self
            .with_write_retry("update", |pool| async move {
                TransferRepo::complete(&pool, id, outcome).await
            })
            .await?;
        if !updated {
            return Err(LedgerError::NotInProgress(id));
        }
        Ok(())
    }

    /// Newest-first history, optionally limited to one session.
    pub async fn query(
        &self,
        limit: i64,
        session_filter: Option<&str>,
    ) -> Result<Vec<TransferAttempt>, LedgerError> {
        let pool = self.pool.read().await.clone();
        Ok(TransferRepo::list_recent(&pool, limit.max(0), session_filter).await?)
    }

    /// Fetch one attempt.
    pub async fn get(&self, id: DbId) -> Result<Option<TransferAttempt>, LedgerError> {
        let pool = self.pool.read().await.clone();
        Ok(TransferRepo::find_by_id(&pool, id).await?)
    }

    /// Total rows currently stored.
    pub async fn count(&self) -> Result<i64, LedgerError> {
        let pool = self.pool.read().await.clone();
        Ok(TransferRepo::count(&pool).await?)
    }

    /// Remove every finished row. `InProgress` rows are kept.
    pub async fn clear_history(&self) -> Result<u64, LedgerError> {
        let removed = self
            .with_write_retry("clear_history", |pool| async move {
                TransferRepo::delete_finished(&pool).await
            })
            .await?;
        tracing::info!(removed, "Transfer history cleared");
        Ok(removed)
    }

    /// `false` once write retries have been exhausted.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    // ---- private helpers ----

    /// Run a write with bounded retries, reopening the store between
    /// attempts. Disables the ledger when every attempt fails.
    async fn with_write_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut(DbPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        if !self.is_enabled() {
            return Err(LedgerError::Disabled);
        }

        let attempts = self.config.write_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let pool = self.pool.read().await.clone();
            match op(pool).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(operation, attempt, error = %e, "Ledger write failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
                if let Err(e) = self.reconnect().await {
                    tracing::warn!(error = %e, "Ledger reconnect failed");
                }
            }
        }

        self.enabled.store(false, Ordering::SeqCst);
        tracing::error!(
            fatal = true,
            operation,
            attempts,
            "Audit ledger disabled after exhausting write retries",
        );
        Err(last_error.map_or(LedgerError::Disabled, LedgerError::Database))
    }

    /// Replace the pool with a freshly opened one.
    async fn reconnect(&self) -> Result<(), LedgerError> {
        let fresh = create_pool(&self.path).await?;
        ensure_schema(&fresh).await?;
        let old = std::mem::replace(&mut *self.pool.write().await, fresh);
        old.close().await;
        tracing::info!(path = %self.path.display(), "Ledger store reconnected");
        Ok(())
    }
}

/// Open the store, verify its integrity, and make sure the schema exists.
async fn open_verified(path: &Path) -> Result<DbPool, LedgerError> {
    let pool = create_pool(path).await?;
    match integrity_check(&pool).await {
        Ok(true) => {}
        Ok(false) => {
            pool.close().await;
            return Err(LedgerError::Corrupt("integrity_check did not report ok".into()));
        }
        Err(e) => {
            pool.close().await;
            return Err(e.into());
        }
    }
    if let Err(e) = ensure_schema(&pool).await {
        pool.close().await;
        return Err(e.into());
    }
    Ok(pool)
}

/// Move a corrupt store (and its WAL side files) out of the way.
async fn backup_corrupt_store(path: &Path) -> Result<PathBuf, LedgerError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger.db".to_string());
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let backup = path.with_file_name(format!("{file_name}.corrupt-{stamp}.bak"));

    tokio::fs::rename(path, &backup).await?;
    for suffix in ["-wal", "-shm"] {
        let side = path.with_file_name(format!("{file_name}{suffix}"));
        match tokio::fs::remove_file(&side).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    tracing::warn!(backup = %backup.display(), "Corrupt audit store backed up");
    Ok(backup)
}
