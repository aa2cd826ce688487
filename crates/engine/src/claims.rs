//! Process-wide claim set.
//!
//! Before a rule touches a file it claims both the source and the
//! destination path. A second rule that wants either path while the claim
//! is held skips the file for this cycle. Claims are released when the
//! returned [`ClaimGuard`] is dropped.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared set of paths currently being worked on.
#[derive(Debug, Default)]
pub struct ClaimSet {
    held: Mutex<HashSet<PathBuf>>,
}

impl ClaimSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically claim every path in `paths`, or none of them.
    ///
    /// Returns `None` if any path is already held.
    pub fn try_claim(self: &Arc<Self>, paths: &[&Path]) -> Option<ClaimGuard> {
        let keys: Vec<PathBuf> = paths.iter().map(|p| normalize(p)).collect();
        let mut held = self.lock();
        if keys.iter().any(|k| held.contains(k)) {
            return None;
        }
        for key in &keys {
            held.insert(key.clone());
        }
        Some(ClaimGuard {
            set: Arc::clone(self),
            keys,
        })
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.lock().contains(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases its paths on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    set: Arc<ClaimSet>,
    keys: Vec<PathBuf>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock();
        for key in &self.keys {
            held.remove(key);
        }
    }
}

/// Lexically normalise a path so different spellings of the same file
/// share one key. Case-folded on Windows.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if cfg!(windows) {
        PathBuf::from(out.to_string_lossy().to_lowercase())
    } else {
        out
    }
}
