//! Peer approval for gated transfers.
//!
//! The rule engine asks an [`ApprovalGate`] before moving a file of an
//! approval-gated rule. [`PeerApproval`] forwards the question over the
//! outbound RPC channel. Timeouts and an unreachable peer come back as
//! [`ApprovalDecision::Unavailable`], which the engine never treats as
//! consent.

use async_trait::async_trait;
use ferry_rpc::messages::PermissionRequest;
use ferry_rpc::ConnectionManager;

/// Outcome of a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allowed,
    /// The peer explicitly refused.
    Denied(Option<String>),
    /// No answer could be obtained.
    Unavailable(String),
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(&self, request: PermissionRequest) -> ApprovalDecision;
}

/// Asks the peer over a managed RPC channel.
pub struct PeerApproval {
    manager: ConnectionManager,
}

impl PeerApproval {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ApprovalGate for PeerApproval {
    async fn request(&self, request: PermissionRequest) -> ApprovalDecision {
        let file = request.file_name.clone();
        match self.manager.ask_permission(request).await {
            Ok(response) if response.allowed => ApprovalDecision::Allowed,
            Ok(response) => ApprovalDecision::Denied(response.message),
            Err(e) => {
                tracing::debug!(file = %file, error = %e, "Permission request failed");
                ApprovalDecision::Unavailable(e.to_string())
            }
        }
    }
}
