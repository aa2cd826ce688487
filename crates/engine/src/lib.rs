//! Rule engines, orchestration and the service's control surface.
//!
//! Each active rule runs its own scan loop ([`rule_engine`]). The
//! [`Orchestrator`] owns their lifecycle, the persisted pause flag and the
//! fail-closed halts; [`ControlHandler`] exposes it over the RPC channel.

pub mod activation;
pub mod approval;
pub mod claims;
pub mod config;
pub mod config_watch;
pub mod context;
pub mod control;
pub mod error;
pub mod markers;
pub mod mover;
pub mod orchestrator;
pub mod rule_engine;
pub mod scanner;
pub mod state;
pub mod status_board;

pub use approval::{ApprovalDecision, ApprovalGate, PeerApproval};
pub use config::{ApprovalUnavailableMode, EngineConfig};
pub use control::ControlHandler;
pub use error::EngineError;
pub use orchestrator::Orchestrator;
pub use rule_engine::{CycleReport, RuleEngine};
