//! `ferry-service` -- background file transfer service.
//!
//! Loads and validates the rules file, opens the audit ledger, starts one
//! scan loop per active rule, and serves the control RPC endpoint that a
//! monitor connects to. Approval-gated rules ask the monitor's approval
//! endpoint over a managed outbound connection.
//!
//! See [`ferry_service::config::Settings::from_env`] for the environment
//! variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ferry_engine::{ApprovalGate, ControlHandler, Orchestrator, PeerApproval};
use ferry_events::EventBus;
use ferry_rpc::{serve, ConnectionManager, SessionRegistry};
use ferry_service::config::{load_rules, Settings};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "ferry_service=info,ferry_engine=info,ferry_db=info,ferry_rpc=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("Invalid service configuration")?;
    init_tracing(settings.log_json);

    // --- Rules ---
    let rules = load_rules(&settings.rules_file)
        .with_context(|| format!("Failed to load rules from {}", settings.rules_file.display()))?;
    tracing::info!(
        path = %settings.rules_file.display(),
        rules = rules.len(),
        active = rules.iter().filter(|r| r.active).count(),
        "Rules loaded",
    );

    // --- Audit ledger ---
    let session_id = uuid::Uuid::new_v4().to_string();
    let ledger = ferry_db::AuditLedger::open(&settings.ledger_path, &session_id, settings.ledger_config())
        .await
        .context("Failed to open audit ledger")?;
    let ledger = Arc::new(ledger);

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    // --- Approval channel ---
    let approval = settings
        .approval_channel()
        .map(|config| ConnectionManager::spawn(config, cancel.child_token()));
    let approval_manager = approval.as_ref().map(|(manager, _)| manager.clone());
    let gate = approval_manager
        .clone()
        .map(|manager| Arc::new(PeerApproval::new(manager)) as Arc<dyn ApprovalGate>);

    // --- Orchestrator ---
    let orchestrator = Arc::new(
        Orchestrator::new(
            settings.engine_config(),
            rules,
            Arc::clone(&ledger),
            Arc::clone(&event_bus),
            gate,
        )
        .context("Failed to configure orchestrator")?,
    );
    match orchestrator.start().await {
        Ok(report) => tracing::info!(
            session_id = %session_id,
            orphans_reclaimed = report.orphans_reclaimed,
            purged = report.purged,
            "Transfer service started",
        ),
        // Keep serving so the monitor can see the error status.
        Err(e) => tracing::error!(fatal = true, error = %e, "Orchestrator failed to start"),
    }

    let mut background = Vec::new();
    if let Some(manager) = approval_manager.clone() {
        background.push(tokio::spawn(mirror_peer_state(
            manager,
            Arc::clone(&orchestrator),
            cancel.child_token(),
        )));
    }

    // --- Control endpoint ---
    let listener = TcpListener::bind(&settings.control_addr)
        .await
        .with_context(|| format!("Failed to bind control endpoint {}", settings.control_addr))?;
    let handler = Arc::new(ControlHandler::new(
        Arc::clone(&orchestrator),
        SessionRegistry::new(settings.session_lease()),
        approval_manager,
    ));
    let server = tokio::spawn(serve(
        listener,
        handler,
        Some(Arc::clone(&event_bus)),
        cancel.child_token(),
    ));

    shutdown_signal().await;

    // --- Shutdown ---
    orchestrator.shutdown().await;
    cancel.cancel();

    let timeout = settings.shutdown_timeout();
    if tokio::time::timeout(timeout, server).await.is_err() {
        tracing::warn!("Control server did not stop in time");
    }
    if let Some((_, driver)) = approval {
        background.push(driver);
    }
    for task in background {
        let abort = task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            abort.abort();
        }
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect the approval channel and keep the status board's peer state in
/// sync with it.
async fn mirror_peer_state(
    manager: ConnectionManager,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
) {
    let mut state = manager.watch_state();
    if !manager.connect().await {
        tracing::info!("Approval endpoint not reachable yet, retrying in background");
    }

    loop {
        let current = state.borrow_and_update().state;
        orchestrator.board().set_peer_state(current.as_str());
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
