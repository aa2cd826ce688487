//! Session-scoped memory of inert files.
//!
//! A file that cannot progress (empty, colliding under skip policy,
//! failed every move attempt, or denied by the peer) is remembered by
//! `(rule, file name)` together with its size and modification time. Until
//! either changes, later cycles skip it silently instead of logging or
//! recording it again.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::Utc;
use ferry_core::types::Timestamp;

/// Why a file was set aside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerReason {
    ZeroByte,
    Collision,
    Failed,
    Denied,
}

#[derive(Debug, Clone)]
struct Marker {
    size: u64,
    modified: Option<SystemTime>,
    first_seen: Timestamp,
    reason: MarkerReason,
}

/// `(rule, file name)` → what the file looked like when it was set aside.
#[derive(Debug, Default)]
pub struct InertMarkers {
    markers: Mutex<HashMap<(String, String), Marker>>,
}

impl InertMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// If the file was set aside and has not changed since, the reason.
    ///
    /// A changed file loses its marker and is evaluated afresh.
    pub fn unchanged(
        &self,
        rule: &str,
        file: &str,
        size: u64,
        modified: Option<SystemTime>,
    ) -> Option<MarkerReason> {
        let mut markers = self.lock();
        let key = (rule.to_string(), file.to_string());
        let marker = markers.get(&key)?;
        if marker.size == size && marker.modified == modified {
            return Some(marker.reason);
        }
        tracing::debug!(
            rule,
            file,
            reason = ?marker.reason,
            since = %marker.first_seen,
            "Set-aside file changed, re-evaluating",
        );
        markers.remove(&key);
        None
    }

    /// Set a file aside. Returns `true` if it was not already remembered
    /// in this exact state.
    pub fn remember(
        &self,
        rule: &str,
        file: &str,
        size: u64,
        modified: Option<SystemTime>,
        reason: MarkerReason,
    ) -> bool {
        let mut markers = self.lock();
        let key = (rule.to_string(), file.to_string());
        if let Some(existing) = markers.get(&key) {
            if existing.size == size && existing.modified == modified && existing.reason == reason {
                return false;
            }
        }
        markers.insert(
            key,
            Marker {
                size,
                modified,
                first_seen: Utc::now(),
                reason,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Marker>> {
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unchanged_file_stays_set_aside() {
        let markers = InertMarkers::new();
        let mtime = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100));

        assert!(markers.remember("Docs", "b.txt", 0, mtime, MarkerReason::ZeroByte));
        assert!(!markers.remember("Docs", "b.txt", 0, mtime, MarkerReason::ZeroByte));
        assert_eq!(markers.unchanged("Docs", "b.txt", 0, mtime), Some(MarkerReason::ZeroByte));
    }

    #[test]
    fn size_or_mtime_change_clears_marker() {
        let markers = InertMarkers::new();
        let mtime = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100));
        let later = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(200));

        markers.remember("Docs", "c.txt", 5, mtime, MarkerReason::Collision);
        assert_eq!(markers.unchanged("Docs", "c.txt", 5, later), None);
        assert!(markers.is_empty());

        markers.remember("Docs", "c.txt", 5, mtime, MarkerReason::Collision);
        assert_eq!(markers.unchanged("Docs", "c.txt", 6, mtime), None);
    }

    #[test]
    fn markers_are_per_rule() {
        let markers = InertMarkers::new();
        markers.remember("Docs", "a.txt", 1, None, MarkerReason::Denied);
        assert_eq!(markers.unchanged("Images", "a.txt", 1, None), None);
    }
}
