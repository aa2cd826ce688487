//! Answers the service's permission requests.
//!
//! Only the monitor that holds the session may approve anything; a
//! standby monitor denies every request so two peers never both grant.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use ferry_core::rules::file_extension;
use ferry_rpc::messages::{
    HealthCheckResponse, PermissionRequest, PermissionResponse, Reply, Request,
};
use ferry_rpc::{RpcHandler, SessionRole};
use tokio::sync::watch;

/// Static approval rules read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Lowercase extensions that are always refused.
    pub denied_extensions: Vec<String>,
    /// Files above this size are refused.
    pub max_file_size: Option<i64>,
    /// Refuse everything, e.g. while an operator is away.
    pub deny_all: bool,
}

impl ApprovalPolicy {
    /// Read the policy from the environment.
    ///
    /// | Env Var                    | Default | Description                         |
    /// |----------------------------|---------|-------------------------------------|
    /// | `MONITOR_DENY_EXTENSIONS`  | empty   | Comma-separated, e.g. `exe,bat`     |
    /// | `MONITOR_MAX_FILE_MB`      | unset   | Refuse larger files                 |
    /// | `MONITOR_DENY_ALL`         | `false` | Refuse every request                |
    pub fn from_env() -> Self {
        let denied_extensions = std::env::var("MONITOR_DENY_EXTENSIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let max_file_size = std::env::var("MONITOR_MAX_FILE_MB")
            .ok()
            .and_then(|v| megabytes_to_bytes(&v));
        let deny_all = std::env::var("MONITOR_DENY_ALL")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            denied_extensions,
            max_file_size,
            deny_all,
        }
    }

    pub fn decide(&self, request: &PermissionRequest) -> PermissionResponse {
        if self.deny_all {
            return PermissionResponse::deny("All transfers are currently refused");
        }
        if let Some(ext) = file_extension(&request.file_name) {
            if self.denied_extensions.contains(&ext) {
                return PermissionResponse::deny(format!(".{ext} files are not allowed"));
            }
        }
        if let Some(max) = self.max_file_size {
            if request.file_size > max {
                return PermissionResponse::deny(format!(
                    "{} exceeds the {} MB limit",
                    request.file_name,
                    max / (1024 * 1024)
                ));
            }
        }
        PermissionResponse::allow()
    }
}

/// RPC handler for the monitor's approval endpoint.
pub struct MonitorHandler {
    policy: ApprovalPolicy,
    role: watch::Receiver<SessionRole>,
    started: Instant,
}

impl MonitorHandler {
    pub fn new(policy: ApprovalPolicy, role: watch::Receiver<SessionRole>) -> Self {
        Self {
            policy,
            role,
            started: Instant::now(),
        }
    }

    fn permission(&self, request: &PermissionRequest) -> PermissionResponse {
        let role = self.role.borrow().clone();
        let response = match role {
            SessionRole::Owner => self.policy.decide(request),
            SessionRole::Standby(holder) => {
                PermissionResponse::deny(format!("Standby; session held by {}", holder.identity))
            }
            SessionRole::Unregistered => PermissionResponse::deny("Monitor is not registered"),
        };
        tracing::info!(
            rule = %request.rule_name,
            file = %request.file_name,
            size = request.file_size,
            allowed = response.allowed,
            reason = response.message.as_deref().unwrap_or(""),
            "Permission request answered",
        );
        response
    }
}

#[async_trait]
impl RpcHandler for MonitorHandler {
    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::RequestPermission(req) => Reply::Permission(self.permission(&req)),
            Request::HealthCheck(_) => Reply::Health(HealthCheckResponse {
                healthy: true,
                timestamp: Utc::now(),
                uptime_secs: self.started.elapsed().as_secs(),
                memory_bytes: None,
            }),
            other => Reply::error(format!("{} is not served by the monitor", other.method())),
        }
    }
}

/// Parse a size in megabytes. Absurdly large values saturate instead of
/// wrapping.
fn megabytes_to_bytes(value: &str) -> Option<i64> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|mb| *mb >= 0)
        .map(|mb| mb.saturating_mul(1024 * 1024))
}
