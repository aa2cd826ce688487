//! Persisted state shared between the service and anything else that
//! reads the state file.
//!
//! Every read goes to disk so a value written by another process is
//! picked up. Writes replace the file atomically (temp file + rename) and
//! are serialized by an in-process lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use ferry_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    pub paused: bool,
    pub session_id: Option<String>,
    pub updated_at: Timestamp,
}

/// Single-writer accessor for the state file.
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open the state file, creating it on first run.
    ///
    /// `initial_paused` only matters when the file does not exist (or is
    /// unreadable); afterwards the persisted value wins. The returned flag
    /// tells whether this was a first run.
    pub fn open(path: impl Into<PathBuf>, initial_paused: bool) -> Result<(Self, bool), EngineError> {
        let store = Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        };
        if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let first_run = match store.load() {
            Ok(_) => false,
            Err(e) => {
                if store.path.exists() {
                    tracing::warn!(path = %store.path.display(), error = %e, "State file unreadable, reseeding");
                }
                store.write(&SharedState {
                    paused: initial_paused,
                    session_id: None,
                    updated_at: Utc::now(),
                })?;
                true
            }
        };
        Ok((store, first_run))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current state from disk.
    pub fn load(&self) -> Result<SharedState, EngineError> {
        let bytes = std::fs::read(&self.path).map_err(|e| self.error(e))?;
        serde_json::from_slice(&bytes).map_err(|e| self.error(e))
    }

    pub fn set_paused(&self, paused: bool) -> Result<SharedState, EngineError> {
        self.update(|state| state.paused = paused)
    }

    pub fn set_session(&self, session_id: &str) -> Result<SharedState, EngineError> {
        self.update(|state| state.session_id = Some(session_id.to_string()))
    }

    // ---- private helpers ----

    fn update(&self, f: impl FnOnce(&mut SharedState)) -> Result<SharedState, EngineError> {
        let _guard = self.lock();
        let mut state = self.load()?;
        f(&mut state);
        state.updated_at = Utc::now();
        self.write_unlocked(&state)?;
        Ok(state)
    }

    fn write(&self, state: &SharedState) -> Result<(), EngineError> {
        let _guard = self.lock();
        self.write_unlocked(state)
    }

    fn write_unlocked(&self, state: &SharedState) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| self.error(e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| self.error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn error(&self, e: impl std::fmt::Display) -> EngineError {
        EngineError::State {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}
