//! Moving one file.
//!
//! A rename is tried first. When that fails (typically across devices)
//! the file is copied, the copy is flushed to disk, and only then is the
//! source removed.

use std::io;
use std::path::Path;
use std::time::Duration;

/// Move `src` to `dst`, creating the destination folder if needed.
///
/// With `overwrite`, an existing destination file is removed just before
/// the move.
pub async fn move_file(src: &Path, dst: &Path, overwrite: bool) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if overwrite {
        match tokio::fs::remove_file(dst).await {
            Ok(()) => tracing::debug!(path = %dst.display(), "Removed existing destination"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    } else if tokio::fs::try_exists(dst).await? {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination exists: {}", dst.display()),
        ));
    }

    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !tokio::fs::try_exists(src).await.unwrap_or(false) {
                return Err(rename_err);
            }
            tracing::debug!(
                src = %src.display(),
                error = %rename_err,
                "Rename failed, falling back to copy",
            );
            copy_then_delete(src, dst).await
        }
    }
}

async fn copy_then_delete(src: &Path, dst: &Path) -> io::Result<()> {
    if let Err(e) = tokio::fs::copy(src, dst).await {
        // Never leave a partial copy behind.
        let _ = tokio::fs::remove_file(dst).await;
        return Err(e);
    }
    let copy = tokio::fs::File::open(dst).await?;
    copy.sync_all().await?;
    drop(copy);
    tokio::fs::remove_file(src).await
}

/// Result of [`move_with_retry`].
#[derive(Debug)]
pub struct MoveReport {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub result: io::Result<()>,
}

/// Try [`move_file`] up to `attempts` times with a fixed delay in between.
pub async fn move_with_retry(
    src: &Path,
    dst: &Path,
    overwrite: bool,
    attempts: u32,
    delay: Duration,
) -> MoveReport {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match move_file(src, dst, overwrite).await {
            Ok(()) => {
                return MoveReport {
                    attempts: attempt,
                    result: Ok(()),
                }
            }
            Err(e) => {
                tracing::warn!(
                    src = %src.display(),
                    attempt,
                    error = %e,
                    "Move attempt failed",
                );
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    MoveReport {
        attempts,
        result: Err(last_error.unwrap_or_else(|| io::Error::other("move failed"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moves_into_new_destination_folder() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("out/deep/a.txt");
        std::fs::write(&src, b"hello").unwrap();

        move_file(&src, &dst, false).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let err = move_file(&src, &dst, false).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(src.exists());

        move_file(&src, &dst, true).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_fallback_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("copy.txt");
        std::fs::write(&src, b"payload").unwrap();

        copy_then_delete(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.txt");
        let dst = dir.path().join("out/missing.txt");

        let report = move_with_retry(&src, &dst, false, 3, Duration::from_millis(1)).await;
        assert_eq!(report.attempts, 3);
        assert!(report.result.is_err());
    }
}
