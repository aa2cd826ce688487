//! Registrant side of the session protocol.
//!
//! [`SessionClient`] registers an identity over a
//! [`ConnectionManager`] channel and then heartbeats at a fixed interval.
//! The decisions live in [`SessionTracker`], which takes the current time
//! as an argument so it can be tested without timers.
//!
//! Gap detection uses the wall clock: a host suspend shows up there even
//! where the monotonic clock stops.

use std::time::Duration;

use chrono::Utc;
use ferry_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::ConnectionManager;
use crate::messages::{HeartbeatRequest, HeartbeatResponse, HolderInfo, RegisterRequest, RegisterResponse};

/// A heartbeat gap of this many intervals marks the session stale.
pub const STALE_GAP_FACTOR: u32 = 2;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// What this registrant currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", content = "holder", rename_all = "snake_case")]
pub enum SessionRole {
    Unregistered,
    /// We hold the session and may act exclusively.
    Owner,
    /// Someone else holds it; exclusive behaviour is relinquished.
    Standby(HolderInfo),
}

impl SessionRole {
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner)
    }
}

/// What the client loop must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Keep heartbeating.
    Continue,
    /// Send a registration on the current channel.
    Register,
    /// Tear the channel down, reconnect, then register.
    ReconnectAndRegister,
}

// ---------------------------------------------------------------------------
// SessionTracker
// ---------------------------------------------------------------------------

/// Pure decision logic of the registrant.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    interval: Duration,
    registered: bool,
    last_sent: Option<Timestamp>,
    role: SessionRole,
}

impl SessionTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            registered: false,
            last_sent: None,
            role: SessionRole::Unregistered,
        }
    }

    pub fn role(&self) -> &SessionRole {
        &self.role
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Decide what to do at a tick observed at `now`.
    ///
    /// A gap of at least [`STALE_GAP_FACTOR`] intervals since the last
    /// sent heartbeat drops the registration and forces a reconnect before
    /// heartbeats resume.
    pub fn on_tick(&mut self, now: Timestamp) -> SessionAction {
        if let Some(last) = self.last_sent {
            let gap = (now - last).to_std().unwrap_or(Duration::ZERO);
            if gap >= self.interval * STALE_GAP_FACTOR {
                tracing::warn!(
                    gap_ms = gap.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "Heartbeat gap detected, session considered stale",
                );
                self.reset();
                return SessionAction::ReconnectAndRegister;
            }
        }
        if self.registered {
            SessionAction::Continue
        } else {
            SessionAction::Register
        }
    }

    /// Record that a heartbeat was sent at `now`.
    pub fn heartbeat_sent(&mut self, now: Timestamp) {
        self.last_sent = Some(now);
    }

    pub fn on_register(&mut self, response: &RegisterResponse, now: Timestamp) {
        self.registered = true;
        self.last_sent = Some(now);
        self.role = match (response.accepted, &response.holder) {
            (true, _) => SessionRole::Owner,
            (false, Some(holder)) => SessionRole::Standby(holder.clone()),
            // Rejected without a named holder: try again next tick.
            (false, None) => {
                self.registered = false;
                SessionRole::Unregistered
            }
        };
    }

    pub fn on_heartbeat(&mut self, response: &HeartbeatResponse) -> SessionAction {
        if response.is_owner {
            self.role = SessionRole::Owner;
            return SessionAction::Continue;
        }
        match &response.holder {
            Some(holder) => {
                if self.role.is_owner() {
                    tracing::warn!(holder = %holder.identity, "Session ownership lost");
                }
                self.role = SessionRole::Standby(holder.clone());
                SessionAction::Continue
            }
            None => {
                self.registered = false;
                self.role = SessionRole::Unregistered;
                SessionAction::Register
            }
        }
    }

    /// The channel went away.
    pub fn on_disconnected(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.registered = false;
        self.last_sent = None;
        self.role = SessionRole::Unregistered;
    }
}

// ---------------------------------------------------------------------------
// SessionClient
// ---------------------------------------------------------------------------

/// Registrant settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: String,
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    /// Deadline for each register/heartbeat call.
    pub call_timeout: Duration,
    pub force: bool,
}

impl SessionConfig {
    /// Settings with a fresh random instance id.
    pub fn new(identity: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            identity: identity.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval,
            call_timeout: Duration::from_secs(5),
            force: false,
        }
    }
}

/// Handle to a running registrant.
#[derive(Clone)]
pub struct SessionClient {
    role: watch::Receiver<SessionRole>,
    instance_id: String,
}

impl SessionClient {
    /// Spawn the register/heartbeat loop on `manager`'s channel.
    pub fn spawn(
        manager: ConnectionManager,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (role_tx, role_rx) = watch::channel(SessionRole::Unregistered);
        let handle = Self {
            role: role_rx,
            instance_id: config.instance_id.clone(),
        };
        let task = tokio::spawn(run_session(manager, config, role_tx, cancel));
        (handle, task)
    }

    pub fn role(&self) -> SessionRole {
        self.role.borrow().clone()
    }

    pub fn watch_role(&self) -> watch::Receiver<SessionRole> {
        self.role.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

async fn run_session(
    manager: ConnectionManager,
    config: SessionConfig,
    role_tx: watch::Sender<SessionRole>,
    cancel: CancellationToken,
) {
    let mut tracker = SessionTracker::new(config.heartbeat_interval);
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        identity = %config.identity,
        instance_id = %config.instance_id,
        interval_ms = config.heartbeat_interval.as_millis() as u64,
        "Session client started",
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !manager.is_connected() {
            if tracker.is_registered() {
                tracing::info!("Channel down, session registration dropped");
            }
            tracker.on_disconnected();
            publish(&role_tx, &tracker);
            continue;
        }

        let mut action = tracker.on_tick(Utc::now());
        if action == SessionAction::ReconnectAndRegister {
            publish(&role_tx, &tracker);
            manager.reconnect();
            // Registration follows on the first tick after the new channel
            // is up.
            continue;
        }

        if action == SessionAction::Continue {
            let request = HeartbeatRequest {
                instance_id: config.instance_id.clone(),
                timestamp: Utc::now(),
            };
            tracker.heartbeat_sent(Utc::now());
            match manager.heartbeat(request, config.call_timeout).await {
                Ok(response) => action = tracker.on_heartbeat(&response),
                Err(e) => {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        }

        if action == SessionAction::Register {
            let request = RegisterRequest {
                identity: config.identity.clone(),
                instance_id: config.instance_id.clone(),
                force: config.force,
            };
            match manager.register(request, config.call_timeout).await {
                Ok(response) => {
                    tracker.on_register(&response, Utc::now());
                    match tracker.role() {
                        SessionRole::Owner => tracing::info!("Session registered as owner"),
                        SessionRole::Standby(holder) => tracing::info!(
                            holder = %holder.identity,
                            "Session held elsewhere, standing by",
                        ),
                        SessionRole::Unregistered => {}
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Registration failed"),
            }
        }

        publish(&role_tx, &tracker);
    }

    tracing::info!("Session client stopped");
}

fn publish(role_tx: &watch::Sender<SessionRole>, tracker: &SessionTracker) {
    role_tx.send_if_modified(|role| {
        if role == tracker.role() {
            return false;
        }
        *role = tracker.role().clone();
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(identity: &str) -> HolderInfo {
        HolderInfo {
            identity: identity.into(),
            instance_id: format!("{identity}-id"),
        }
    }

    fn accepted(identity: &str) -> RegisterResponse {
        RegisterResponse {
            accepted: true,
            holder: Some(holder(identity)),
        }
    }

    #[test]
    fn starts_by_registering() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.on_tick(Utc::now()), SessionAction::Register);
        assert_eq!(tracker.role(), &SessionRole::Unregistered);
    }

    #[test]
    fn accepted_registration_makes_owner() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        let now = Utc::now();
        tracker.on_register(&accepted("me"), now);
        assert_eq!(tracker.role(), &SessionRole::Owner);
        assert_eq!(
            tracker.on_tick(now + chrono::Duration::seconds(5)),
            SessionAction::Continue
        );
    }

    #[test]
    fn rejected_registration_stands_by() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        tracker.on_register(
            &RegisterResponse {
                accepted: false,
                holder: Some(holder("other")),
            },
            Utc::now(),
        );
        assert_eq!(tracker.role(), &SessionRole::Standby(holder("other")));
        assert!(tracker.is_registered());
    }

    #[test]
    fn gap_of_two_intervals_is_stale() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        let start = Utc::now();
        tracker.on_register(&accepted("me"), start);

        // Just under the threshold: fine.
        assert_eq!(
            tracker.on_tick(start + chrono::Duration::milliseconds(9_999)),
            SessionAction::Continue
        );

        // At the threshold: stale, registration dropped.
        assert_eq!(
            tracker.on_tick(start + chrono::Duration::seconds(10)),
            SessionAction::ReconnectAndRegister
        );
        assert!(!tracker.is_registered());
        assert_eq!(tracker.role(), &SessionRole::Unregistered);

        // Heartbeats do not resume before a new registration.
        assert_eq!(
            tracker.on_tick(start + chrono::Duration::seconds(11)),
            SessionAction::Register
        );
    }

    #[test]
    fn regular_heartbeats_never_go_stale() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        let start = Utc::now();
        tracker.on_register(&accepted("me"), start);

        for step in 1..=20 {
            let now = start + chrono::Duration::seconds(5 * step);
            assert_eq!(tracker.on_tick(now), SessionAction::Continue);
            tracker.heartbeat_sent(now);
        }
    }

    #[test]
    fn ownership_lost_to_named_holder_relinquishes() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        tracker.on_register(&accepted("me"), Utc::now());

        let action = tracker.on_heartbeat(&HeartbeatResponse {
            acknowledged: true,
            is_owner: false,
            holder: Some(holder("admin")),
        });
        assert_eq!(action, SessionAction::Continue);
        assert_eq!(tracker.role(), &SessionRole::Standby(holder("admin")));
    }

    #[test]
    fn no_holder_at_all_re_registers() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        tracker.on_register(&accepted("me"), Utc::now());

        let action = tracker.on_heartbeat(&HeartbeatResponse {
            acknowledged: true,
            is_owner: false,
            holder: None,
        });
        assert_eq!(action, SessionAction::Register);
        assert!(!tracker.is_registered());
    }

    #[test]
    fn standby_regains_ownership_when_told() {
        let mut tracker = SessionTracker::new(Duration::from_secs(5));
        tracker.on_register(
            &RegisterResponse {
                accepted: false,
                holder: Some(holder("other")),
            },
            Utc::now(),
        );
        tracker.on_heartbeat(&HeartbeatResponse {
            acknowledged: true,
            is_owner: true,
            holder: Some(holder("me")),
        });
        assert!(tracker.role().is_owner());
    }
}
