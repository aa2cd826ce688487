//! `ferry-monitor` -- reference peer for `ferry-service`.
//!
//! Connects to the service's control endpoint, registers and heartbeats
//! via the session protocol, logs every event the service pushes, and
//! serves permission requests on its own approval endpoint.
//!
//! # Environment variables
//!
//! | Variable                 | Default                 | Description                          |
//! |--------------------------|-------------------------|--------------------------------------|
//! | `MONITOR_SERVICE_URL`    | `ws://127.0.0.1:47100`  | Service control endpoint             |
//! | `MONITOR_APPROVAL_ADDR`  | `127.0.0.1:47101`       | Where to serve permission requests   |
//! | `MONITOR_IDENTITY`       | `monitor@$USER`         | Identity sent on registration        |
//! | `MONITOR_HEARTBEAT_SECS` | `5`                     | Heartbeat interval                   |
//! | `MONITOR_FORCE`          | `false`                 | Take over an existing session        |
//! | `MONITOR_LOG_JSON`       | `false`                 | JSON log lines                       |
//!
//! Approval policy variables are listed on
//! [`ApprovalPolicy::from_env`](ferry_monitor::policy::ApprovalPolicy::from_env).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ferry_events::FerryEvent;
use ferry_monitor::policy::{ApprovalPolicy, MonitorHandler};
use ferry_rpc::messages::Reply;
use ferry_rpc::{
    serve, ConnectionManager, ConnectionState, ManagerConfig, SessionClient, SessionConfig,
    SessionRole,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_HEARTBEAT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(env_flag("MONITOR_LOG_JSON"));

    let service_url =
        std::env::var("MONITOR_SERVICE_URL").unwrap_or_else(|_| "ws://127.0.0.1:47100".into());
    let approval_addr =
        std::env::var("MONITOR_APPROVAL_ADDR").unwrap_or_else(|_| "127.0.0.1:47101".into());
    let identity = std::env::var("MONITOR_IDENTITY").unwrap_or_else(|_| {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".into());
        format!("monitor@{user}")
    });
    let heartbeat_secs: u64 = std::env::var("MONITOR_HEARTBEAT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_SECS);

    let session = SessionConfig {
        force: env_flag("MONITOR_FORCE"),
        ..SessionConfig::new(identity, Duration::from_secs(heartbeat_secs.max(1)))
    };
    tracing::info!(
        service_url = %service_url,
        approval_addr = %approval_addr,
        identity = %session.identity,
        instance_id = %session.instance_id,
        "Starting ferry-monitor",
    );

    let cancel = CancellationToken::new();

    // --- Control channel and session ---
    let (control, control_driver) =
        ConnectionManager::spawn(ManagerConfig::new("control", service_url), cancel.child_token());
    let events = control.subscribe_events();
    if !control.connect().await {
        tracing::warn!("Service not reachable yet, retrying in background");
    }
    let (client, session_task) = SessionClient::spawn(control.clone(), session, cancel.child_token());

    // --- Approval endpoint ---
    let listener = TcpListener::bind(&approval_addr)
        .await
        .with_context(|| format!("Failed to bind approval endpoint {approval_addr}"))?;
    let handler = Arc::new(MonitorHandler::new(
        ApprovalPolicy::from_env(),
        client.watch_role(),
    ));
    let server = tokio::spawn(serve(listener, handler, None, cancel.child_token()));

    let watcher = tokio::spawn(watch_service(
        control,
        client,
        events,
        cancel.child_token(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
    tracing::info!("Shutting down");
    cancel.cancel();

    for task in [server, watcher, session_task, control_driver] {
        let abort = task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(3), task).await.is_err() {
            abort.abort();
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ferry_monitor=info,ferry_rpc=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Log pushed events, session role changes, and a status snapshot after
/// every (re)connect.
async fn watch_service(
    control: ConnectionManager,
    client: SessionClient,
    mut events: broadcast::Receiver<FerryEvent>,
    cancel: CancellationToken,
) {
    let mut role = client.watch_role();
    let mut state = control.watch_state();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed service events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = role.changed() => {
                if changed.is_err() {
                    break;
                }
                match &*role.borrow_and_update() {
                    SessionRole::Owner => tracing::info!("Holding the service session"),
                    SessionRole::Standby(holder) => tracing::warn!(
                        holder = %holder.identity,
                        "Another monitor holds the session, standing by",
                    ),
                    SessionRole::Unregistered => tracing::info!("Session lost, re-registering"),
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = state.borrow_and_update().state == ConnectionState::Connected;
                if connected {
                    print_status(&control).await;
                }
            }
        }
    }
}

async fn print_status(control: &ConnectionManager) {
    match control
        .call(ferry_rpc::messages::Request::Status, Duration::from_secs(5))
        .await
    {
        Ok(Reply::Status(status)) => tracing::info!(
            mode = ?status.mode,
            icon = ?status.icon,
            message = %status.message,
            rules = ?status.active_rules,
            ledger_enabled = status.ledger_enabled,
            "Service status",
        ),
        Ok(other) => tracing::warn!(reply = other.kind(), "Unexpected status reply"),
        Err(e) => tracing::warn!(error = %e, "Status request failed"),
    }
}

fn log_event(event: &FerryEvent) {
    match event {
        FerryEvent::StatusChanged(status) => {
            tracing::info!(mode = ?status.mode, message = %status.message, "Status changed")
        }
        FerryEvent::IconChanged { icon } => tracing::info!(icon = ?icon, "Icon changed"),
        FerryEvent::RecentActivity { line, .. } => tracing::info!(line = %line, "Activity"),
        FerryEvent::Transfer(n) => tracing::info!(
            rule = %n.rule_name,
            file = %n.file_name,
            destination = %n.destination,
            size = n.size,
            status = %n.status,
            message = n.message.as_deref().unwrap_or(""),
            "Transfer",
        ),
    }
}
