//! Local RPC channel between the ferry service and its monitor.
//!
//! - [`messages`]: JSON wire frames and typed request/reply bodies.
//! - [`server`]: accept loop with per-request dispatch and event push.
//! - [`manager`]: resilient outbound channel with backoff and a reactive
//!   reconnect trigger.
//! - [`registry`] / [`session`]: the register + heartbeat session protocol,
//!   holder side and registrant side.

pub mod client;
pub mod error;
pub mod manager;
pub mod messages;
pub mod reconnect;
pub mod registry;
pub mod server;
pub mod session;

pub use error::RpcError;
pub use manager::{ConnectionManager, ConnectionSnapshot, ConnectionState, ManagerConfig};
pub use registry::SessionRegistry;
pub use server::{serve, RpcHandler};
pub use session::{SessionClient, SessionConfig, SessionRole};
