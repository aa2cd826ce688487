//! Lifecycle of the whole transfer service.
//!
//! The [`Orchestrator`] validates nothing itself: it is handed validated
//! rules, an open ledger and an event bus. It runs ledger maintenance,
//! starts one task per active rule in activation order, and supervises
//! configuration drift, ledger health and the persisted pause flag until
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ferry_core::rules::{activation_order, Rule};
use ferry_core::status::{ErrorReason, ServiceStatus};
use ferry_core::transfer::TransferAttempt;
use ferry_db::{AuditLedger, StartupReport};
use ferry_events::EventBus;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::config::EngineConfig;
use crate::config_watch::ConfigWatcher;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::rule_engine::RuleEngine;
use crate::state::StateStore;
use crate::status_board::StatusBoard;

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    state: Arc<StateStore>,
    rules: Vec<Arc<RuleEngine>>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

impl Orchestrator {
    /// Build the orchestrator for an already validated rule set.
    ///
    /// Captures the rules file fingerprint and opens the state file. The
    /// configured pause flag only applies on a first run.
    pub fn new(
        config: EngineConfig,
        rules: Vec<Rule>,
        ledger: Arc<AuditLedger>,
        bus: Arc<EventBus>,
        approval: Option<Arc<dyn ApprovalGate>>,
    ) -> Result<Self, EngineError> {
        let watcher = ConfigWatcher::capture(&config.rules_path)?;
        let (state, first_run) = StateStore::open(&config.state_path, config.start_paused)?;
        let paused = state.set_session(ledger.session_id())?.paused;

        let ordered = activation_order(&rules);
        let names = ordered.iter().map(|r| r.name.clone()).collect();
        let specific_rules = ordered.iter().filter(|r| !r.match_all).count();
        let board = Arc::new(StatusBoard::new(bus, ledger.session_id(), names));
        board.set_paused(paused);

        tracing::info!(
            session_id = %ledger.session_id(),
            rules = ordered.len(),
            paused,
            first_run,
            "Orchestrator configured",
        );

        let cancel = CancellationToken::new();
        let ctx = Arc::new(EngineContext::new(
            config,
            ledger,
            board,
            approval,
            watcher,
            specific_rules,
            paused,
            cancel.child_token(),
        ));
        let rules = ordered
            .into_iter()
            .map(|rule| RuleEngine::new(rule, Arc::clone(&ctx)))
            .collect();

        Ok(Self {
            ctx,
            state: Arc::new(state),
            rules,
            cancel,
            tasks: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Run ledger maintenance, then start every rule and the supervisor.
    ///
    /// A ledger that cannot be maintained halts the service before any
    /// rule starts.
    pub async fn start(&self) -> Result<StartupReport, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let report = match self.ctx.ledger.startup_maintenance().await {
            Ok(report) => report,
            Err(e) => {
                self.ctx.halt(ErrorReason::LedgerUnavailable, e.to_string());
                return Err(EngineError::Ledger(e));
            }
        };
        if let Some(backup) = &report.backup_path {
            self.ctx.board.push_activity(format!(
                "Audit store was corrupt; moved aside to {}",
                backup.display()
            ));
        }
        if report.orphans_reclaimed > 0 {
            self.ctx.board.push_activity(format!(
                "{} interrupted transfers from earlier sessions marked failed",
                report.orphans_reclaimed
            ));
        }

        let mut tasks = self.lock_tasks();
        for rule in &self.rules {
            let token = self.ctx.rules_cancel().child_token();
            tasks.spawn(Arc::clone(rule).run(token));
        }
        tasks.spawn(supervise(
            Arc::clone(&self.ctx),
            Arc::clone(&self.state),
            self.rules.clone(),
            self.cancel.child_token(),
        ));

        tracing::info!(rules = self.rules.len(), "Orchestrator started");
        Ok(report)
    }

    pub fn pause(&self) -> Result<bool, EngineError> {
        self.toggle_pause(true)
    }

    pub fn resume(&self) -> Result<bool, EngineError> {
        self.toggle_pause(false)
    }

    /// Persist and apply the pause flag. Resuming opens a new activation
    /// round and triggers an immediate cycle of every rule. Returns the new
    /// flag.
    pub fn toggle_pause(&self, paused: bool) -> Result<bool, EngineError> {
        if !paused {
            if let Some(reason) = self.ctx.halted() {
                return Err(EngineError::Halted(reason));
            }
        }
        self.state.set_paused(paused)?;
        let was_paused = self.ctx.set_paused(paused);
        if was_paused != paused {
            tracing::info!(paused, "Pause state changed");
            self.ctx
                .board
                .push_activity(if paused { "Transfers paused" } else { "Transfers resumed" });
        }
        if was_paused && !paused {
            start_round(&self.ctx, &self.rules);
        }
        Ok(paused)
    }

    pub fn status(&self) -> ServiceStatus {
        self.ctx.board.set_ledger_enabled(self.ctx.ledger.is_enabled());
        self.ctx.board.snapshot()
    }

    /// Newest-first history, optionally limited to this session.
    pub async fn recent_history(
        &self,
        limit: i64,
        current_session_only: bool,
    ) -> Result<Vec<TransferAttempt>, EngineError> {
        let session = current_session_only.then(|| self.ctx.ledger.session_id());
        Ok(self.ctx.ledger.query(limit, session).await?)
    }

    pub async fn clear_history(&self) -> Result<u64, EngineError> {
        let removed = self.ctx.ledger.clear_history().await?;
        self.ctx.board.push_activity(format!("History cleared ({removed} rows)"));
        Ok(removed)
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.ctx.board
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Rule engines in activation order.
    pub fn rules(&self) -> &[Arc<RuleEngine>] {
        &self.rules
    }

    pub fn session_id(&self) -> &str {
        self.ctx.ledger.session_id()
    }

    pub fn halted(&self) -> Option<ErrorReason> {
        self.ctx.halted()
    }

    /// Stop every task, waiting up to the configured timeout before
    /// aborting whatever is still running, then close the ledger.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        let timeout = self.ctx.config.shutdown_timeout;

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Engine task panicked");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                timeout_secs = timeout.as_secs(),
                "Shutdown timed out, aborting remaining tasks",
            );
            tasks.shutdown().await;
        }

        self.ctx.ledger.close().await;
        tracing::info!("Orchestrator stopped");
    }

    // ---- private helpers ----

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Give every rule an immediate cycle. Catch-all rules hold theirs until
/// the specific rules have finished the new round.
fn start_round(ctx: &EngineContext, rules: &[Arc<RuleEngine>]) {
    let round = ctx.activation.begin();
    tracing::debug!(round, "Activation round opened");
    for rule in rules {
        rule.wake();
    }
}

/// Periodic checks that apply to the service as a whole.
async fn supervise(
    ctx: Arc<EngineContext>,
    state: Arc<StateStore>,
    rules: Vec<Arc<RuleEngine>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(ctx.config.supervisor_tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(tick_ms = ctx.config.supervisor_tick.as_millis() as u64, "Supervisor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if ctx.halted().is_some() {
            continue;
        }

        if ctx.watcher.has_changed() {
            ctx.halt(
                ErrorReason::ConfigChanged,
                format!("{} changed after startup", ctx.watcher.path().display()),
            );
            continue;
        }

        if !ctx.ledger.is_enabled() {
            ctx.halt(
                ErrorReason::LedgerUnavailable,
                "Audit ledger disabled after repeated write failures",
            );
            continue;
        }

        match state.load() {
            Ok(persisted) if persisted.paused != ctx.is_paused() => {
                tracing::info!(paused = persisted.paused, "Pause state changed on disk");
                ctx.set_paused(persisted.paused);
                if !persisted.paused {
                    start_round(&ctx, &rules);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not reload state file"),
        }
    }

    tracing::debug!("Supervisor stopped");
}
