//! Holder table for the session protocol (server side).
//!
//! At most one registrant holds the session at a time. A second
//! registration is rejected with the current holder's identity unless it
//! is forced. A holder whose heartbeats stop for longer than the lease
//! lapses, after which the next registration succeeds.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::messages::{
    HeartbeatRequest, HeartbeatResponse, HolderInfo, RegisterRequest, RegisterResponse,
};

struct Holder {
    info: HolderInfo,
    last_seen: Instant,
}

/// Tracks who currently owns the session.
pub struct SessionRegistry {
    lease: Duration,
    holder: Mutex<Option<Holder>>,
}

impl SessionRegistry {
    /// `lease` is how long a holder survives without a heartbeat.
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            holder: Mutex::new(None),
        }
    }

    /// Handle a registration attempt observed at `now`.
    pub fn register(&self, request: &RegisterRequest, now: Instant) -> RegisterResponse {
        let mut holder = self.lock();
        self.expire(&mut holder, now);

        let blocked_by = holder
            .as_ref()
            .filter(|h| h.info.instance_id != request.instance_id)
            .map(|h| h.info.clone());

        match blocked_by {
            Some(current) if !request.force => {
                tracing::info!(
                    identity = %request.identity,
                    holder = %current.identity,
                    "Registration rejected, session already held",
                );
                RegisterResponse {
                    accepted: false,
                    holder: Some(current),
                }
            }
            previous => {
                if let Some(previous) = previous {
                    tracing::warn!(
                        identity = %request.identity,
                        displaced = %previous.identity,
                        "Registration forced over existing holder",
                    );
                } else {
                    tracing::info!(
                        identity = %request.identity,
                        instance_id = %request.instance_id,
                        "Session registered",
                    );
                }
                let info = HolderInfo {
                    identity: request.identity.clone(),
                    instance_id: request.instance_id.clone(),
                };
                *holder = Some(Holder {
                    info: info.clone(),
                    last_seen: now,
                });
                RegisterResponse {
                    accepted: true,
                    holder: Some(info),
                }
            }
        }
    }

    /// Acknowledge a heartbeat and report whether the caller still holds
    /// the session.
    pub fn heartbeat(&self, request: &HeartbeatRequest, now: Instant) -> HeartbeatResponse {
        let mut holder = self.lock();
        self.expire(&mut holder, now);

        let is_owner = match holder.as_mut() {
            Some(h) if h.info.instance_id == request.instance_id => {
                h.last_seen = now;
                true
            }
            _ => false,
        };

        HeartbeatResponse {
            acknowledged: true,
            is_owner,
            holder: holder.as_ref().map(|h| h.info.clone()),
        }
    }

    /// Current holder, if its lease is still valid.
    pub fn holder(&self, now: Instant) -> Option<HolderInfo> {
        let mut holder = self.lock();
        self.expire(&mut holder, now);
        holder.as_ref().map(|h| h.info.clone())
    }

    /// Drop the holder if it is `instance_id`.
    pub fn release(&self, instance_id: &str) -> bool {
        let mut holder = self.lock();
        if holder
            .as_ref()
            .is_some_and(|h| h.info.instance_id == instance_id)
        {
            *holder = None;
            tracing::info!(instance_id, "Session released");
            return true;
        }
        false
    }

    // ---- private helpers ----

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        // The table holds plain data; a poisoned lock still has a usable value.
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expire(&self, holder: &mut Option<Holder>, now: Instant) {
        let lapsed = holder
            .as_ref()
            .is_some_and(|h| now.saturating_duration_since(h.last_seen) > self.lease);
        if lapsed {
            if let Some(h) = holder.take() {
                tracing::info!(identity = %h.info.identity, "Session holder lapsed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(identity: &str, instance: &str, force: bool) -> RegisterRequest {
        RegisterRequest {
            identity: identity.into(),
            instance_id: instance.into(),
            force,
        }
    }

    fn hb(instance: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            instance_id: instance.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn first_registration_wins() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let now = Instant::now();

        let first = registry.register(&reg("monitor@a", "i-1", false), now);
        assert!(first.accepted);

        let second = registry.register(&reg("monitor@b", "i-2", false), now);
        assert!(!second.accepted);
        assert_eq!(second.holder.unwrap().identity, "monitor@a");
    }

    #[test]
    fn same_instance_may_register_again() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let now = Instant::now();
        registry.register(&reg("monitor@a", "i-1", false), now);
        assert!(registry.register(&reg("monitor@a", "i-1", false), now).accepted);
    }

    #[test]
    fn force_overrides_holder() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let now = Instant::now();
        registry.register(&reg("monitor@a", "i-1", false), now);

        let forced = registry.register(&reg("admin", "i-2", true), now);
        assert!(forced.accepted);

        let old = registry.heartbeat(&hb("i-1"), now);
        assert!(old.acknowledged);
        assert!(!old.is_owner);
        assert_eq!(old.holder.unwrap().identity, "admin");
    }

    #[test]
    fn silent_holder_lapses_after_lease() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let start = Instant::now();
        registry.register(&reg("monitor@a", "i-1", false), start);

        let later = start + Duration::from_secs(16);
        assert!(registry.holder(later).is_none());

        let response = registry.heartbeat(&hb("i-1"), later);
        assert!(!response.is_owner);
        assert!(response.holder.is_none());

        assert!(registry.register(&reg("monitor@b", "i-2", false), later).accepted);
    }

    #[test]
    fn heartbeats_extend_the_lease() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let start = Instant::now();
        registry.register(&reg("monitor@a", "i-1", false), start);

        for step in 1..=5 {
            let now = start + Duration::from_secs(10 * step);
            assert!(registry.heartbeat(&hb("i-1"), now).is_owner);
        }
    }

    #[test]
    fn release_only_drops_matching_holder() {
        let registry = SessionRegistry::new(Duration::from_secs(15));
        let now = Instant::now();
        registry.register(&reg("monitor@a", "i-1", false), now);

        assert!(!registry.release("i-2"));
        assert!(registry.release("i-1"));
        assert!(registry.holder(now).is_none());
    }
}
