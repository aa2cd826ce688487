//! Errors raised by the RPC transport.

/// Errors that can occur on the local RPC channel.
///
/// Every variant is recoverable from the orchestrator's point of view:
/// callers map them to a safe default rather than propagating them.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connect(String),

    /// A call was made while no channel is open.
    #[error("Not connected")]
    NotConnected,

    /// No response arrived before the call deadline.
    #[error("Call timed out")]
    Timeout,

    /// The channel dropped while the call was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// The manager task has stopped.
    #[error("Connection manager shut down")]
    Shutdown,

    /// The peer answered with an error reply.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The peer answered with a reply of the wrong kind.
    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },

    /// Malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
