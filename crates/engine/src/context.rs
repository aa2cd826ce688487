//! State shared by the orchestrator and every rule engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ferry_core::status::ErrorReason;
use ferry_db::AuditLedger;
use tokio_util::sync::CancellationToken;

use crate::activation::ActivationRounds;
use crate::approval::ApprovalGate;
use crate::claims::ClaimSet;
use crate::config::EngineConfig;
use crate::config_watch::ConfigWatcher;
use crate::markers::InertMarkers;
use crate::status_board::StatusBoard;

pub struct EngineContext {
    pub config: EngineConfig,
    pub ledger: Arc<AuditLedger>,
    pub claims: Arc<ClaimSet>,
    pub markers: InertMarkers,
    pub board: Arc<StatusBoard>,
    pub approval: Option<Arc<dyn ApprovalGate>>,
    pub watcher: ConfigWatcher,
    pub activation: ActivationRounds,
    paused: AtomicBool,
    halted: Mutex<Option<ErrorReason>>,
    /// Parent of every rule task's token.
    rules_cancel: CancellationToken,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<AuditLedger>,
        board: Arc<StatusBoard>,
        approval: Option<Arc<dyn ApprovalGate>>,
        watcher: ConfigWatcher,
        specific_rules: usize,
        paused: bool,
        rules_cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            ledger,
            claims: ClaimSet::new(),
            markers: InertMarkers::new(),
            board,
            approval,
            watcher,
            activation: ActivationRounds::new(specific_rules),
            paused: AtomicBool::new(paused),
            halted: Mutex::new(None),
            rules_cancel,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        let previous = self.paused.swap(paused, Ordering::SeqCst);
        self.board.set_paused(paused);
        previous
    }

    pub fn halted(&self) -> Option<ErrorReason> {
        *self.halted.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rules_cancel(&self) -> &CancellationToken {
        &self.rules_cancel
    }

    /// Enter the terminal error mode: stop every rule and surface the
    /// reason. Only the first call has any effect.
    pub fn halt(&self, reason: ErrorReason, detail: impl Into<String>) {
        let detail = detail.into();
        {
            let mut halted = self.halted.lock().unwrap_or_else(|e| e.into_inner());
            if halted.is_some() {
                return;
            }
            *halted = Some(reason);
        }
        tracing::error!(fatal = true, reason = ?reason, detail = %detail, "Transfers halted");
        self.rules_cancel.cancel();
        if reason == ErrorReason::LedgerUnavailable {
            self.board.set_ledger_enabled(false);
        }
        self.board.set_error(reason, detail);
    }
}
