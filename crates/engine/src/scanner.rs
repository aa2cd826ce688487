//! Source folder listing and the per-file filters.
//!
//! Only immediate children of the source folder are considered; the scan
//! is not recursive. Candidates come back in directory enumeration order.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use ferry_core::rules::{DateField, Rule};
use ferry_core::types::Timestamp;

/// A file in a rule's source folder that matches its name filter.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl FileCandidate {
    /// The timestamp a date filter inspects, if the platform reports it.
    pub fn time_of(&self, field: DateField) -> Option<Timestamp> {
        let time = match field {
            DateField::Accessed => self.accessed,
            DateField::Modified => self.modified,
            DateField::Created => self.created,
        }?;
        Some(DateTime::<Utc>::from(time))
    }
}

/// List the regular files in `rule.source` whose names match the rule.
pub async fn list_candidates(rule: &Rule) -> std::io::Result<Vec<FileCandidate>> {
    let mut entries = tokio::fs::read_dir(&rule.source).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(rule = %rule.name, path = ?entry.path(), "Skipping non UTF-8 file name");
            continue;
        };
        if !rule.matches_name(&name) {
            continue;
        }
        // The file may vanish between listing and stat.
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(rule = %rule.name, file = %name, error = %e, "Stat failed, skipping");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        candidates.push(FileCandidate {
            name,
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            created: metadata.created().ok(),
        });
    }

    Ok(candidates)
}

/// Whether the rule's date filter (if any) admits the file.
///
/// A file whose filtered timestamp is unavailable on this platform does not
/// match.
pub fn passes_date_filter(rule: &Rule, candidate: &FileCandidate, now: Timestamp) -> bool {
    let Some(filter) = rule.date_filter else {
        return true;
    };
    match candidate.time_of(filter.field) {
        Some(time) => filter.matches(time, now),
        None => false,
    }
}

/// Whether another process holds the file open.
///
/// On Windows the file is opened with no sharing, which fails while any
/// other handle is open. Elsewhere the test is a read-write open, which
/// catches permission problems and files that vanished.
pub fn is_locked(path: &Path) -> bool {
    open_exclusive(path).is_err()
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::windows::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().read(true).write(true).open(path)
}
