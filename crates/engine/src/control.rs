//! Inbound control surface of the service.
//!
//! [`ControlHandler`] answers the calls a monitor makes: status, pause,
//! history, health, and the register/heartbeat session protocol. Any
//! session traffic from the peer also nudges the outbound approval channel
//! to reconnect if it is down.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use ferry_core::status::ServiceMode;
use ferry_rpc::messages::{HealthCheckResponse, Reply, Request};
use ferry_rpc::{ConnectionManager, RpcHandler, SessionRegistry};

use crate::orchestrator::Orchestrator;

/// Upper bound for one history page.
const MAX_HISTORY_LIMIT: i64 = 1000;

pub struct ControlHandler {
    orchestrator: Arc<Orchestrator>,
    sessions: SessionRegistry,
    approval_channel: Option<ConnectionManager>,
    memory_ceiling_bytes: Option<u64>,
    started: Instant,
}

impl ControlHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        sessions: SessionRegistry,
        approval_channel: Option<ConnectionManager>,
    ) -> Self {
        let memory_ceiling_bytes = orchestrator.context().config.memory_ceiling_bytes;
        Self {
            orchestrator,
            sessions,
            approval_channel,
            memory_ceiling_bytes,
            started: Instant::now(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn health(&self) -> HealthCheckResponse {
        let memory_bytes = resident_memory_bytes();
        let within_ceiling = match (memory_bytes, self.memory_ceiling_bytes) {
            (Some(used), Some(ceiling)) => used <= ceiling,
            _ => true,
        };
        let halted = matches!(self.orchestrator.status().mode, ServiceMode::Error(_));
        HealthCheckResponse {
            healthy: within_ceiling && !halted,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            memory_bytes,
        }
    }
}

#[async_trait]
impl RpcHandler for ControlHandler {
    async fn handle(&self, request: Request) -> Reply {
        if request.is_session_traffic() {
            if let Some(channel) = &self.approval_channel {
                channel.peer_contacted();
            }
        }

        match request {
            Request::Status => Reply::Status(self.orchestrator.status()),
            Request::TogglePause { paused } => match self.orchestrator.toggle_pause(paused) {
                Ok(paused) => Reply::TogglePause {
                    success: true,
                    paused,
                },
                Err(e) => {
                    tracing::warn!(paused, error = %e, "Pause toggle refused");
                    Reply::TogglePause {
                        success: false,
                        paused: self.orchestrator.context().is_paused(),
                    }
                }
            },
            Request::ClearHistory => match self.orchestrator.clear_history().await {
                Ok(removed) => Reply::ClearHistory { removed },
                Err(e) => Reply::error(e.to_string()),
            },
            Request::RecentHistory {
                limit,
                current_session_only,
            } => {
                let limit = limit.clamp(0, MAX_HISTORY_LIMIT);
                match self
                    .orchestrator
                    .recent_history(limit, current_session_only)
                    .await
                {
                    Ok(attempts) => Reply::RecentHistory { attempts },
                    Err(e) => Reply::error(e.to_string()),
                }
            }
            Request::HealthCheck(_) => Reply::Health(self.health()),
            Request::Register(req) => Reply::Register(self.sessions.register(&req, Instant::now())),
            Request::Heartbeat(req) => {
                Reply::Heartbeat(self.sessions.heartbeat(&req, Instant::now()))
            }
            Request::RequestPermission(_) => {
                Reply::error("request_permission is answered by the monitor, not the service")
            }
        }
    }
}

/// Resident set size of this process, where the platform exposes it.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}
