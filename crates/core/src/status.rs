//! User-visible service status.
//!
//! The icon always reflects the worst active condition:
//! error > paused > active > waiting.

use serde::{Deserialize, Serialize};

/// Why the orchestrator stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// The configuration source changed after validation.
    ConfigChanged,
    /// The audit ledger could not durably record an attempt.
    LedgerUnavailable,
}

impl ErrorReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ConfigChanged => "Configuration changed on disk; restart required",
            Self::LedgerUnavailable => "Audit ledger unavailable; transfers blocked",
        }
    }
}

/// Orchestrator mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "reason", rename_all = "snake_case")]
pub enum ServiceMode {
    Running,
    Paused,
    /// Terminal for the run.
    Error(ErrorReason),
}

/// Tray-style icon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusIcon {
    Waiting,
    Active,
    Paused,
    Error,
}

impl StatusIcon {
    /// Icon for a mode plus the number of transfers currently in flight.
    pub fn for_mode(mode: ServiceMode, in_flight: usize) -> Self {
        match mode {
            ServiceMode::Error(_) => Self::Error,
            ServiceMode::Paused => Self::Paused,
            ServiceMode::Running if in_flight > 0 => Self::Active,
            ServiceMode::Running => Self::Waiting,
        }
    }
}

/// Snapshot returned by the status RPC and pushed on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub mode: ServiceMode,
    pub icon: StatusIcon,
    /// One-line human readable summary.
    pub message: String,
    /// Detailed error text, available on demand.
    pub last_error: Option<String>,
    pub session_id: String,
    pub active_rules: Vec<String>,
    pub ledger_enabled: bool,
    /// Connection state of the outbound approval channel.
    pub peer_state: String,
    /// Newest first.
    pub recent_activity: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_condition_wins() {
        let err = ServiceMode::Error(ErrorReason::ConfigChanged);
        assert_eq!(StatusIcon::for_mode(err, 3), StatusIcon::Error);
        assert_eq!(StatusIcon::for_mode(ServiceMode::Paused, 3), StatusIcon::Paused);
        assert_eq!(StatusIcon::for_mode(ServiceMode::Running, 1), StatusIcon::Active);
        assert_eq!(StatusIcon::for_mode(ServiceMode::Running, 0), StatusIcon::Waiting);
        assert!(StatusIcon::Error > StatusIcon::Paused);
        assert!(StatusIcon::Paused > StatusIcon::Active);
        assert!(StatusIcon::Active > StatusIcon::Waiting);
    }

    #[test]
    fn mode_serializes_with_reason() {
        let json = serde_json::to_value(ServiceMode::Error(ErrorReason::LedgerUnavailable)).unwrap();
        assert_eq!(json["mode"], "error");
        assert_eq!(json["reason"], "ledger_unavailable");
    }
}
