//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`FerryEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the service.

use chrono::Utc;
use ferry_core::status::{ServiceStatus, StatusIcon};
use ferry_core::transfer::TransferStatus;
use ferry_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// FerryEvent
// ---------------------------------------------------------------------------

/// Outcome of one processed file, pushed to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferNotification {
    pub rule_name: String,
    pub file_name: String,
    pub destination: String,
    pub size: i64,
    pub status: TransferStatus,
    pub message: Option<String>,
    pub timestamp: Timestamp,
}

/// A fact emitted by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FerryEvent {
    /// The full status snapshot changed.
    StatusChanged(ServiceStatus),

    /// The icon changed (cheap subset of `StatusChanged`).
    IconChanged { icon: StatusIcon },

    /// One human-readable activity line.
    RecentActivity { line: String, timestamp: Timestamp },

    /// A file finished processing (moved, failed, or denied).
    Transfer(TransferNotification),
}

impl FerryEvent {
    /// Build a `RecentActivity` event stamped with the current time.
    pub fn activity(line: impl Into<String>) -> Self {
        Self::RecentActivity {
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged(_) => "status_changed",
            Self::IconChanged { .. } => "icon_changed",
            Self::RecentActivity { .. } => "recent_activity",
            Self::Transfer(_) => "transfer",
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`FerryEvent`].
///
/// # Usage
///
/// ```rust
/// use ferry_events::bus::{EventBus, FerryEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(FerryEvent::activity("Docs: moved a.txt"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<FerryEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: FerryEvent) {
        tracing::trace!(kind = event.kind(), "Publishing event");
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<FerryEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(FerryEvent::IconChanged {
            icon: StatusIcon::Paused,
        });

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(
            received,
            FerryEvent::IconChanged {
                icon: StatusIcon::Paused
            }
        );
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(FerryEvent::activity("Docs: moved a.txt"));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");

        assert_eq!(e1.kind(), "recent_activity");
        assert_eq!(e1, e2);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        // No subscribers, this must not panic.
        bus.publish(FerryEvent::activity("orphan"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(FerryEvent::IconChanged {
            icon: StatusIcon::Error,
        })
        .unwrap();
        assert_eq!(json["type"], "icon_changed");
        assert_eq!(json["data"]["icon"], "error");
    }
}
