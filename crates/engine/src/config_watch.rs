//! Configuration drift detection.

use std::path::{Path, PathBuf};

use ferry_core::hashing::fingerprint_file;

/// Fingerprint of the rules file captured when it was validated.
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    baseline: String,
}

impl ConfigWatcher {
    /// Capture the current fingerprint of `path` as the baseline.
    pub fn capture(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let baseline = fingerprint_file(&path)?;
        Ok(Self { path, baseline })
    }

    /// Whether the file differs from the baseline. An unreadable file
    /// counts as changed.
    pub fn has_changed(&self) -> bool {
        match fingerprint_file(&self.path) {
            Ok(current) => current != self.baseline,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Config source unreadable");
                true
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_edit_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, b"[]").unwrap();

        let watcher = ConfigWatcher::capture(&path).unwrap();
        assert!(!watcher.has_changed());

        std::fs::write(&path, b"[{}]").unwrap();
        assert!(watcher.has_changed());

        std::fs::write(&path, b"[]").unwrap();
        assert!(!watcher.has_changed());

        std::fs::remove_file(&path).unwrap();
        assert!(watcher.has_changed());
    }
}
