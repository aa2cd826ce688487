//! One rule's scan loop.
//!
//! Each active rule runs its own [`RuleEngine`] task. A cycle lists the
//! source folder and walks the candidates through a fixed sequence of
//! checks; a file is only moved after its `InProgress` row is durably in
//! the ledger and the configuration is confirmed unchanged.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ferry_core::rules::{CollisionPolicy, Rule};
use ferry_core::status::ErrorReason;
use ferry_core::transfer::{NewTransferAttempt, TransferOutcome, TransferStatus};
use ferry_events::TransferNotification;
use ferry_rpc::messages::PermissionRequest;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalDecision;
use crate::config::ApprovalUnavailableMode;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::markers::MarkerReason;
use crate::mover::move_with_retry;
use crate::scanner::{is_locked, list_candidates, passes_date_filter, FileCandidate};

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub moved: usize,
    pub failed: usize,
    pub denied: usize,
    pub skipped: usize,
    /// The cycle stopped early because approval was unavailable.
    pub aborted: bool,
    /// Another cycle of the same rule was still running.
    pub overlapped: bool,
}

impl CycleReport {
    fn is_quiet(&self) -> bool {
        self.moved == 0 && self.failed == 0 && self.denied == 0 && !self.aborted
    }
}

enum FileFlow {
    /// Nothing was attempted for this file.
    Skipped,
    /// The file was moved, failed, or denied.
    Processed,
    AbortCycle,
}

pub struct RuleEngine {
    rule: Rule,
    ctx: Arc<EngineContext>,
    running: AtomicBool,
    wake: Notify,
}

impl RuleEngine {
    pub fn new(rule: Rule, ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            rule,
            ctx,
            running: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Request an immediate cycle.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Scan loop. Starts after a random offset so rules sharing a cadence
    /// do not all hit the disk at once. A catch-all rule holds each cycle
    /// until the specific rules have finished the current activation round.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let jitter = start_jitter(self.ctx.config.max_jitter);
        tracing::info!(
            rule = %self.rule.name,
            interval_secs = self.rule.scan_interval().as_secs(),
            jitter_ms = jitter.as_millis() as u64,
            "Rule started",
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        let mut ticker = tokio::time::interval(self.rule.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut arrived_in = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.ctx.is_paused() {
                continue;
            }

            if self.rule.match_all && !self.ctx.activation.is_settled() {
                tracing::debug!(rule = %self.rule.name, "Waiting for specific rules to finish their pass");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.ctx.activation.settled() => {}
                }
                if self.ctx.is_paused() {
                    continue;
                }
            }

            let round = self.ctx.activation.current();
            let result = self.run_cycle(&cancel).await;
            if !self.rule.match_all && arrived_in != Some(round) {
                self.ctx.activation.arrive(round);
                arrived_in = Some(round);
            }

            match result {
                Ok(report) if report.is_quiet() => {
                    tracing::trace!(rule = %self.rule.name, ?report, "Cycle finished");
                }
                Ok(report) => {
                    tracing::info!(
                        rule = %self.rule.name,
                        moved = report.moved,
                        failed = report.failed,
                        denied = report.denied,
                        aborted = report.aborted,
                        "Cycle finished",
                    );
                }
                Err(EngineError::Halted(_)) => break,
                Err(e) => {
                    tracing::warn!(rule = %self.rule.name, error = %e, "Cycle failed");
                }
            }
        }

        tracing::info!(rule = %self.rule.name, "Rule stopped");
    }

    /// Run one pass over the source folder.
    ///
    /// Returns immediately with `overlapped` set when a cycle of this rule
    /// is already in progress. Stops between files once `cancel` fires or
    /// the service is paused.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, EngineError> {
        if let Some(reason) = self.ctx.halted() {
            return Err(EngineError::Halted(reason));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!(rule = %self.rule.name, "Previous cycle still running, skipping");
            return Ok(CycleReport {
                overlapped: true,
                ..CycleReport::default()
            });
        }
        let _reset = RunningReset(&self.running);

        let candidates = list_candidates(&self.rule)
            .await
            .map_err(|source| EngineError::Scan {
                path: self.rule.source.clone(),
                source,
            })?;

        let mut report = CycleReport::default();
        for candidate in candidates {
            if cancel.is_cancelled() || self.ctx.is_paused() {
                break;
            }
            if let Some(reason) = self.ctx.halted() {
                return Err(EngineError::Halted(reason));
            }

            match self.process_file(&candidate, &mut report).await? {
                FileFlow::Skipped => report.skipped += 1,
                FileFlow::Processed => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.inter_file_delay) => {}
                    }
                }
                FileFlow::AbortCycle => {
                    report.aborted = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    // ---- private helpers ----

    async fn process_file(
        &self,
        candidate: &FileCandidate,
        report: &mut CycleReport,
    ) -> Result<FileFlow, EngineError> {
        let rule = &self.rule;
        let ctx = &self.ctx;
        let name = candidate.name.as_str();

        if ctx
            .markers
            .unchanged(&rule.name, name, candidate.size, candidate.modified)
            .is_some()
        {
            return Ok(FileFlow::Skipped);
        }

        if candidate.size == 0 {
            if self.set_aside(candidate, MarkerReason::ZeroByte) {
                tracing::info!(rule = %rule.name, file = name, "Ignoring empty file");
            }
            return Ok(FileFlow::Skipped);
        }

        if is_locked(&candidate.path) {
            tracing::debug!(rule = %rule.name, file = name, "File in use, retrying next cycle");
            return Ok(FileFlow::Skipped);
        }

        if !passes_date_filter(rule, candidate, Utc::now()) {
            return Ok(FileFlow::Skipped);
        }

        let destination = rule.destination.join(name);
        let Some(_claim) = ctx
            .claims
            .try_claim(&[candidate.path.as_path(), destination.as_path()]) else {
            tracing::debug!(rule = %rule.name, file = name, "File claimed by another rule");
            return Ok(FileFlow::Skipped);
        };

        let overwrite = match rule.collision_policy {
            CollisionPolicy::Overwrite => true,
            CollisionPolicy::Skip => {
                if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                    if self.set_aside(candidate, MarkerReason::Collision) {
                        tracing::warn!(
                            rule = %rule.name,
                            file = name,
                            destination = %destination.display(),
                            "Destination exists, skipping",
                        );
                        ctx.board
                            .push_activity(format!("{}: skipped {name}, destination exists", rule.name));
                    }
                    return Ok(FileFlow::Skipped);
                }
                false
            }
        };

        if rule.require_approval || ctx.config.require_approval {
            match self.ask_approval(candidate, &destination).await {
                ApprovalDecision::Allowed => {}
                ApprovalDecision::Denied(message) => {
                    self.record_denial(candidate, &destination, message).await?;
                    report.denied += 1;
                    return Ok(FileFlow::Processed);
                }
                ApprovalDecision::Unavailable(error) => {
                    return Ok(match ctx.config.approval_unavailable {
                        ApprovalUnavailableMode::DenyFile => {
                            tracing::warn!(
                                rule = %rule.name,
                                file = name,
                                error = %error,
                                "Approval unavailable, file not moved",
                            );
                            FileFlow::Skipped
                        }
                        ApprovalUnavailableMode::SkipRule => {
                            tracing::warn!(
                                rule = %rule.name,
                                error = %error,
                                "Approval unavailable, abandoning cycle",
                            );
                            FileFlow::AbortCycle
                        }
                    });
                }
            }
        }

        if ctx.watcher.has_changed() {
            ctx.halt(
                ErrorReason::ConfigChanged,
                format!("{} changed after startup", ctx.watcher.path().display()),
            );
            return Err(EngineError::Halted(ErrorReason::ConfigChanged));
        }

        let attempt = NewTransferAttempt::in_progress(
            name,
            path_str(&candidate.path),
            path_str(&destination),
            &rule.name,
            candidate.size as i64,
        );
        let id = match ctx.ledger.record(&attempt).await {
            Ok(id) => id,
            Err(e) => {
                ctx.halt(ErrorReason::LedgerUnavailable, e.to_string());
                return Err(EngineError::Halted(ErrorReason::LedgerUnavailable));
            }
        };

        let moved = {
            let _in_flight = ctx.board.begin_transfer();
            move_with_retry(
                &candidate.path,
                &destination,
                overwrite,
                ctx.config.move_attempts,
                ctx.config.move_retry_delay,
            )
            .await
        };

        let outcome = match &moved.result {
            Ok(()) => TransferOutcome::success(moved.attempts as i64),
            Err(e) => TransferOutcome::failed(e.to_string(), moved.attempts as i64),
        };
        if let Err(e) = ctx.ledger.update(id, &outcome).await {
            ctx.halt(ErrorReason::LedgerUnavailable, e.to_string());
            return Err(EngineError::Halted(ErrorReason::LedgerUnavailable));
        }

        match moved.result {
            Ok(()) => {
                report.moved += 1;
                tracing::info!(
                    rule = %rule.name,
                    file = name,
                    destination = %destination.display(),
                    attempts = moved.attempts,
                    "File moved",
                );
                ctx.board.push_activity(format!("{}: moved {name}", rule.name));
            }
            Err(e) => {
                report.failed += 1;
                self.set_aside(candidate, MarkerReason::Failed);
                tracing::error!(
                    rule = %rule.name,
                    file = name,
                    attempts = moved.attempts,
                    error = %e,
                    "Move failed",
                );
                ctx.board.push_activity(format!("{}: failed to move {name}", rule.name));
            }
        }
        self.notify(candidate, &destination, outcome.status, outcome.error_message);
        Ok(FileFlow::Processed)
    }

    async fn ask_approval(&self, candidate: &FileCandidate, destination: &Path) -> ApprovalDecision {
        let Some(gate) = self.ctx.approval.as_ref() else {
            return ApprovalDecision::Unavailable("no approval channel configured".into());
        };
        gate.request(PermissionRequest {
            file_name: candidate.name.clone(),
            source_path: path_str(&candidate.path),
            destination_path: path_str(destination),
            rule_name: self.rule.name.clone(),
            file_size: candidate.size as i64,
        })
        .await
    }

    async fn record_denial(
        &self,
        candidate: &FileCandidate,
        destination: &Path,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        let reason = message.unwrap_or_else(|| "denied by peer".to_string());
        let attempt = NewTransferAttempt::in_progress(
            &candidate.name,
            path_str(&candidate.path),
            path_str(destination),
            &self.rule.name,
            candidate.size as i64,
        )
        .with_status(TransferStatus::Blacklisted, Some(reason.clone()));

        if let Err(e) = self.ctx.ledger.record(&attempt).await {
            self.ctx.halt(ErrorReason::LedgerUnavailable, e.to_string());
            return Err(EngineError::Halted(ErrorReason::LedgerUnavailable));
        }

        self.set_aside(candidate, MarkerReason::Denied);
        tracing::info!(rule = %self.rule.name, file = %candidate.name, reason = %reason, "Transfer denied");
        self.ctx
            .board
            .push_activity(format!("{}: {} denied", self.rule.name, candidate.name));
        self.notify(candidate, destination, TransferStatus::Blacklisted, Some(reason));
        Ok(())
    }

    fn set_aside(&self, candidate: &FileCandidate, reason: MarkerReason) -> bool {
        self.ctx.markers.remember(
            &self.rule.name,
            &candidate.name,
            candidate.size,
            candidate.modified,
            reason,
        )
    }

    fn notify(
        &self,
        candidate: &FileCandidate,
        destination: &Path,
        status: TransferStatus,
        message: Option<String>,
    ) {
        self.ctx.board.notify_transfer(TransferNotification {
            rule_name: self.rule.name.clone(),
            file_name: candidate.name.clone(),
            destination: path_str(destination),
            size: candidate.size as i64,
            status,
            message,
            timestamp: Utc::now(),
        });
    }
}

/// Clears the re-entrancy flag when a cycle ends, however it ends.
struct RunningReset<'a>(&'a AtomicBool);

impl Drop for RunningReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn start_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bound() {
        assert_eq!(start_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(start_jitter(Duration::from_millis(250)) <= Duration::from_millis(250));
        }
    }

    #[test]
    fn quiet_reports() {
        assert!(CycleReport::default().is_quiet());
        assert!(CycleReport { skipped: 4, ..CycleReport::default() }.is_quiet());
        assert!(!CycleReport { denied: 1, ..CycleReport::default() }.is_quiet());
    }
}
