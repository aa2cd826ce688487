//! Live status shown to peers.
//!
//! The board owns the mode, in-flight count, last error and a short
//! activity log. Every change that affects what a peer would display is
//! pushed on the [`EventBus`]: `StatusChanged` always, `IconChanged` only
//! when the icon actually changes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_core::status::{ErrorReason, ServiceMode, ServiceStatus, StatusIcon};
use ferry_events::{EventBus, FerryEvent, TransferNotification};

/// Lines kept in the activity log.
pub const RECENT_ACTIVITY_CAP: usize = 50;

struct BoardState {
    mode: ServiceMode,
    in_flight: usize,
    last_error: Option<String>,
    recent: VecDeque<String>,
    session_id: String,
    active_rules: Vec<String>,
    ledger_enabled: bool,
    peer_state: String,
    icon: StatusIcon,
}

pub struct StatusBoard {
    state: Mutex<BoardState>,
    bus: Arc<EventBus>,
}

impl StatusBoard {
    pub fn new(bus: Arc<EventBus>, session_id: impl Into<String>, active_rules: Vec<String>) -> Self {
        Self {
            state: Mutex::new(BoardState {
                mode: ServiceMode::Running,
                in_flight: 0,
                last_error: None,
                recent: VecDeque::with_capacity(RECENT_ACTIVITY_CAP),
                session_id: session_id.into(),
                active_rules,
                ledger_enabled: true,
                peer_state: "disconnected".into(),
                icon: StatusIcon::Waiting,
            }),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn mode(&self) -> ServiceMode {
        self.lock().mode
    }

    /// Switch between running and paused. Ignored once in error mode.
    pub fn set_paused(&self, paused: bool) {
        self.mutate(|s| {
            if matches!(s.mode, ServiceMode::Error(_)) {
                return false;
            }
            let next = if paused { ServiceMode::Paused } else { ServiceMode::Running };
            let changed = s.mode != next;
            s.mode = next;
            changed
        });
    }

    /// Enter error mode. The first reason sticks.
    pub fn set_error(&self, reason: ErrorReason, detail: impl Into<String>) {
        let detail = detail.into();
        self.mutate(|s| {
            if matches!(s.mode, ServiceMode::Error(_)) {
                return false;
            }
            s.mode = ServiceMode::Error(reason);
            s.last_error = Some(detail);
            true
        });
    }

    pub fn set_ledger_enabled(&self, enabled: bool) {
        self.mutate(|s| std::mem::replace(&mut s.ledger_enabled, enabled) != enabled);
    }

    pub fn set_peer_state(&self, peer_state: impl Into<String>) {
        let peer_state = peer_state.into();
        self.mutate(|s| {
            if s.peer_state == peer_state {
                return false;
            }
            s.peer_state = peer_state;
            true
        });
    }

    /// Mark one transfer as running until the guard drops.
    pub fn begin_transfer(self: &Arc<Self>) -> InFlightGuard {
        self.mutate(|s| {
            s.in_flight += 1;
            true
        });
        InFlightGuard {
            board: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Append a line to the activity log and push it to peers.
    pub fn push_activity(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut s = self.lock();
            if s.recent.len() == RECENT_ACTIVITY_CAP {
                s.recent.pop_front();
            }
            s.recent.push_back(line.clone());
        }
        self.bus.publish(FerryEvent::activity(line));
    }

    pub fn notify_transfer(&self, notification: TransferNotification) {
        self.bus.publish(FerryEvent::Transfer(notification));
    }

    pub fn snapshot(&self) -> ServiceStatus {
        let s = self.lock();
        Self::render(&s)
    }

    // ---- private helpers ----

    fn render(s: &BoardState) -> ServiceStatus {
        let message = match s.mode {
            ServiceMode::Error(reason) => reason.describe().to_string(),
            ServiceMode::Paused => "Paused".to_string(),
            ServiceMode::Running => match s.active_rules.len() {
                1 => "Watching 1 rule".to_string(),
                n => format!("Watching {n} rules"),
            },
        };
        ServiceStatus {
            mode: s.mode,
            icon: StatusIcon::for_mode(s.mode, s.in_flight),
            message,
            last_error: s.last_error.clone(),
            session_id: s.session_id.clone(),
            active_rules: s.active_rules.clone(),
            ledger_enabled: s.ledger_enabled,
            peer_state: s.peer_state.clone(),
            recent_activity: s.recent.iter().rev().cloned().collect(),
        }
    }

    /// Apply `f`; if it reports a change, publish the new status and, when
    /// the icon moved, the icon.
    fn mutate(&self, f: impl FnOnce(&mut BoardState) -> bool) {
        let (status, icon_changed) = {
            let mut s = self.lock();
            if !f(&mut s) {
                return;
            }
            let icon = StatusIcon::for_mode(s.mode, s.in_flight);
            let icon_changed = icon != s.icon;
            s.icon = icon;
            (Self::render(&s), icon_changed)
        };
        if icon_changed {
            self.bus.publish(FerryEvent::IconChanged { icon: status.icon });
        }
        self.bus.publish(FerryEvent::StatusChanged(status));
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decrements the in-flight count on drop.
pub struct InFlightGuard {
    board: Arc<StatusBoard>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.board.mutate(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn board() -> (Arc<StatusBoard>, tokio::sync::broadcast::Receiver<FerryEvent>) {
        let bus = Arc::new(EventBus::new(64));
        let rx = bus.subscribe();
        let board = Arc::new(StatusBoard::new(bus, "s-1", vec!["Docs".into(), "Images".into()]));
        (board, rx)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<FerryEvent>) -> Vec<FerryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn icon_tracks_in_flight_transfers() {
        let (board, mut rx) = board();
        assert_eq!(board.snapshot().icon, StatusIcon::Waiting);
        assert_eq!(board.snapshot().message, "Watching 2 rules");

        let guard = board.begin_transfer();
        assert_eq!(board.snapshot().icon, StatusIcon::Active);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, FerryEvent::IconChanged { icon: StatusIcon::Active })));

        drop(guard);
        assert_eq!(board.in_flight(), 0);
        assert_eq!(board.snapshot().icon, StatusIcon::Waiting);
    }

    #[test]
    fn error_is_sticky() {
        let (board, _rx) = board();
        board.set_error(ErrorReason::ConfigChanged, "rules.json edited");
        board.set_error(ErrorReason::LedgerUnavailable, "disk full");
        board.set_paused(false);

        let status = board.snapshot();
        assert_eq!(status.mode, ServiceMode::Error(ErrorReason::ConfigChanged));
        assert_eq!(status.icon, StatusIcon::Error);
        assert_eq!(status.last_error.as_deref(), Some("rules.json edited"));
        assert_eq!(status.message, ErrorReason::ConfigChanged.describe());
    }

    #[test]
    fn unchanged_mode_publishes_nothing() {
        let (board, mut rx) = board();
        board.set_paused(false);
        assert!(drain(&mut rx).is_empty());

        board.set_paused(true);
        let events = drain(&mut rx);
        assert_matches!(events.last(), Some(FerryEvent::StatusChanged(s)) if s.message == "Paused");
    }

    #[test]
    fn activity_log_is_bounded_and_newest_first() {
        let (board, _rx) = board();
        for i in 0..(RECENT_ACTIVITY_CAP + 5) {
            board.push_activity(format!("line {i}"));
        }
        let recent = board.snapshot().recent_activity;
        assert_eq!(recent.len(), RECENT_ACTIVITY_CAP);
        assert_eq!(recent[0], format!("line {}", RECENT_ACTIVITY_CAP + 4));
    }
}
