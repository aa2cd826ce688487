//! Engine tuning knobs.
//!
//! The service builds an [`EngineConfig`] from its environment settings;
//! tests build one directly with short timings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ferry_core::error::CoreError;

/// What an approval-gated rule does when the peer cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalUnavailableMode {
    /// Deny each gated file individually; the rest of the cycle goes on.
    #[default]
    DenyFile,
    /// Abandon the remainder of the rule's cycle.
    SkipRule,
}

impl FromStr for ApprovalUnavailableMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny-file" => Ok(Self::DenyFile),
            "skip-rule" => Ok(Self::SkipRule),
            other => Err(CoreError::UnknownValue {
                field: "approval unavailable mode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ApprovalUnavailableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DenyFile => "deny-file",
            Self::SkipRule => "skip-rule",
        })
    }
}

/// Settings shared by the orchestrator and every rule engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rules file whose fingerprint guards against configuration drift.
    pub rules_path: PathBuf,
    /// Persisted shared state (pause flag, session id).
    pub state_path: PathBuf,
    /// Upper bound of each rule's random start offset.
    pub max_jitter: Duration,
    /// Supervisor cadence: config fingerprint, state reload, ledger health.
    pub supervisor_tick: Duration,
    /// Pause between two processed files of one cycle.
    pub inter_file_delay: Duration,
    /// Move attempts per file before it is recorded `Failed`.
    pub move_attempts: u32,
    pub move_retry_delay: Duration,
    /// Ask the peer before every move, for every rule.
    pub require_approval: bool,
    pub approval_unavailable: ApprovalUnavailableMode,
    /// Pause flag used only when no state file exists yet.
    pub start_paused: bool,
    /// Hard limit for cooperative shutdown before tasks are aborted.
    pub shutdown_timeout: Duration,
    /// Health check reports unhealthy above this resident size.
    pub memory_ceiling_bytes: Option<u64>,
}

impl EngineConfig {
    /// Defaults for a rules file and state file.
    pub fn new(rules_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            rules_path: rules_path.into(),
            state_path: state_path.into(),
            max_jitter: Duration::from_secs(10),
            supervisor_tick: Duration::from_secs(5),
            inter_file_delay: Duration::from_millis(100),
            move_attempts: 3,
            move_retry_delay: Duration::from_secs(2),
            require_approval: false,
            approval_unavailable: ApprovalUnavailableMode::DenyFile,
            start_paused: false,
            shutdown_timeout: Duration::from_secs(10),
            memory_ceiling_bytes: None,
        }
    }
}
