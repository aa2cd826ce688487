//! Ferry event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`FerryEvent`]: the facts the orchestrator emits: status changes,
//!   recent activity lines, and transfer notifications.
//!
//! Listeners (the control server's push stream, logging) subscribe
//! independently; the orchestrator never knows who is listening.

pub mod bus;

pub use bus::{EventBus, FerryEvent, TransferNotification};
