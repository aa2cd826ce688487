//! Integration tests for the SQLite audit ledger.

use std::time::Duration;

use assert_matches::assert_matches;
use ferry_core::transfer::{NewTransferAttempt, TransferOutcome, TransferStatus, INTERRUPTED_ERROR};
use chrono::Utc;
use ferry_db::{AuditLedger, LedgerConfig, LedgerError};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};

fn attempt(file: &str) -> NewTransferAttempt {
    NewTransferAttempt::in_progress(file, format!("/in/{file}"), format!("/out/{file}"), "Docs", 10)
}

fn fast_config() -> LedgerConfig {
    LedgerConfig {
        retention_days: None,
        max_rows: None,
        write_retries: 2,
        retry_delay: Duration::from_millis(10),
    }
}

// ---------------------------------------------------------------------------
// record / update / query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn record_then_update_transitions_once() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = AuditLedger::open(dir.path().join("ledger.db"), "s1", fast_config())
        .await
        .unwrap();

    let id = ledger.record(&attempt("a.txt")).await.unwrap();
    let row = ledger.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::InProgress);
    assert_eq!(row.session_id, "s1");

    ledger.update(id, &TransferOutcome::success(1)).await.unwrap();
    let row = ledger.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Success);
    assert_eq!(row.attempt_count, 1);

    // A second transition is refused.
    assert_matches!(
        ledger.update(id, &TransferOutcome::failed("late", 2)).await,
        Err(LedgerError::NotInProgress(rejected)) if rejected == id
    );
}

#[tokio::test]
async fn query_is_newest_first_and_session_filtered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let old = AuditLedger::open(&path, "old", fast_config()).await.unwrap();
    old.record(&attempt("1.txt")).await.unwrap();
    old.close().await;

    let ledger = AuditLedger::open(&path, "new", fast_config()).await.unwrap();
    ledger.record(&attempt("2.txt")).await.unwrap();
    ledger.record(&attempt("3.txt")).await.unwrap();

    let all = ledger.query(10, None).await.unwrap();
    let names: Vec<_> = all.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["3.txt", "2.txt", "1.txt"]);

    let current = ledger.query(10, Some("new")).await.unwrap();
    assert_eq!(current.len(), 2);

    let limited = ledger.query(1, None).await.unwrap();
    assert_eq!(limited[0].file_name, "3.txt");
}

// ---------------------------------------------------------------------------
// Startup maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphans_from_previous_session_become_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let crashed = AuditLedger::open(&path, "crashed", fast_config()).await.unwrap();
    let orphan = crashed.record(&attempt("x.txt")).await.unwrap();
    crashed.close().await;

    let ledger = AuditLedger::open(&path, "fresh", fast_config()).await.unwrap();
    let own = ledger.record(&attempt("y.txt")).await.unwrap();
    let report = ledger.startup_maintenance().await.unwrap();
    assert_eq!(report.orphans_reclaimed, 1);

    let row = ledger.get(orphan).await.unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some(INTERRUPTED_ERROR));

    // Rows of the current session are untouched.
    let row = ledger.get(own).await.unwrap().unwrap();
    assert_eq!(row.status, TransferStatus::InProgress);
}

#[tokio::test]
async fn age_cap_purges_old_finished_rows_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let ledger = AuditLedger::open(&path, "s", fast_config()).await.unwrap();
    let old_done = ledger.record(&attempt("old.txt")).await.unwrap();
    ledger.update(old_done, &TransferOutcome::success(1)).await.unwrap();
    let old_open = ledger.record(&attempt("stuck.txt")).await.unwrap();
    let fresh = ledger.record(&attempt("fresh.txt")).await.unwrap();
    ledger.update(fresh, &TransferOutcome::success(1)).await.unwrap();
    ledger.close().await;

    let pool = ferry_db::create_pool(&path).await.unwrap();
    let hundred_days_ago = Utc::now() - chrono::Duration::days(100);
    for id in [old_done, old_open] {
        sqlx::query("UPDATE transfer_attempts SET timestamp = ? WHERE id = ?")
            .bind(hundred_days_ago)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    let config = LedgerConfig {
        retention_days: Some(30),
        ..fast_config()
    };
    let ledger = AuditLedger::open(&path, "s", config).await.unwrap();
    let report = ledger.startup_maintenance().await.unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(report.orphans_reclaimed, 0);

    assert!(ledger.get(old_done).await.unwrap().is_none());
    // In-progress rows of the current session are never purged.
    assert!(ledger.get(old_open).await.unwrap().is_some());
    assert!(ledger.get(fresh).await.unwrap().is_some());
}

#[tokio::test]
async fn max_rows_truncates_oldest_finished_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = LedgerConfig {
        max_rows: Some(2),
        ..fast_config()
    };
    let ledger = AuditLedger::open(dir.path().join("ledger.db"), "s", config)
        .await
        .unwrap();

    for name in ["1.txt", "2.txt", "3.txt", "4.txt"] {
        let id = ledger.record(&attempt(name)).await.unwrap();
        ledger.update(id, &TransferOutcome::success(1)).await.unwrap();
    }

    let rows = ledger.query(10, None).await.unwrap();
    let names: Vec<_> = rows.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["4.txt", "3.txt"]);
}

#[tokio::test]
async fn clear_history_keeps_in_progress_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = AuditLedger::open(dir.path().join("ledger.db"), "s", fast_config())
        .await
        .unwrap();

    let done = ledger.record(&attempt("done.txt")).await.unwrap();
    ledger.update(done, &TransferOutcome::success(1)).await.unwrap();
    ledger
        .record(&attempt("denied.txt").with_status(TransferStatus::Blacklisted, None))
        .await
        .unwrap();
    let open = ledger.record(&attempt("open.txt")).await.unwrap();

    assert_eq!(ledger.clear_history().await.unwrap(), 2);
    assert_eq!(ledger.count().await.unwrap(), 1);
    assert!(ledger.get(open).await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Corruption and fail-closed behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_store_is_backed_up_and_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    std::fs::write(&path, "this is not a sqlite database ".repeat(512)).unwrap();

    let ledger = AuditLedger::open(&path, "s", fast_config()).await.unwrap();
    let report = ledger.startup_maintenance().await.unwrap();

    let backup = report.backup_path.expect("corrupt store should be backed up");
    assert!(backup.exists());
    assert!(backup
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("ledger.db.corrupt-"));

    // The recreated store is fully usable.
    ledger.record(&attempt("a.txt")).await.unwrap();
    assert_eq!(ledger.count().await.unwrap(), 1);
}

#[tokio::test]
async fn locked_store_is_reported_and_left_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let previous = AuditLedger::open(&path, "earlier", fast_config()).await.unwrap();
    previous.record(&attempt("a.txt")).await.unwrap();
    previous.close().await;

    // Another process holds an exclusive lock on a perfectly healthy store.
    let mut holder = SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(&path))
        .await
        .unwrap();
    sqlx::raw_sql("PRAGMA locking_mode=EXCLUSIVE; BEGIN EXCLUSIVE;")
        .execute(&mut holder)
        .await
        .unwrap();
    let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfer_attempts")
        .fetch_one(&mut holder)
        .await
        .unwrap();
    assert_eq!(held, 1);

    match AuditLedger::open(&path, "s", fast_config()).await {
        Ok(_) => panic!("a locked store must not open"),
        Err(e) => assert!(!e.is_corruption(), "lock reported as corruption: {e}"),
    }
    let backups = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
        .count();
    assert_eq!(backups, 0);

    sqlx::raw_sql("ROLLBACK").execute(&mut holder).await.unwrap();
    holder.close().await.unwrap();

    // Once the lock is gone the original rows are all still there.
    let ledger = AuditLedger::open(&path, "s", fast_config()).await.unwrap();
    let report = ledger.startup_maintenance().await.unwrap();
    assert_eq!(report.backup_path, None);
    assert_eq!(report.orphans_reclaimed, 1);
    assert_eq!(ledger.count().await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_retries_disable_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let ledger = AuditLedger::open(&path, "s", fast_config()).await.unwrap();

    // Make every insert fail in a way a reconnect cannot repair.
    let saboteur = ferry_db::create_pool(&path).await.unwrap();
    sqlx::query("CREATE TRIGGER reject_inserts BEFORE INSERT ON transfer_attempts \
                 BEGIN SELECT RAISE(ABORT, 'store rejected write'); END")
        .execute(&saboteur)
        .await
        .unwrap();
    saboteur.close().await;

    assert!(ledger.record(&attempt("a.txt")).await.is_err());
    assert!(!ledger.is_enabled());

    // Once disabled, writes fail fast without touching the store.
    assert_matches!(ledger.record(&attempt("b.txt")).await, Err(LedgerError::Disabled));
}
