//! Wire format of the local RPC channel.
//!
//! Every WebSocket text frame carries one JSON [`Frame`]:
//!
//! ```text
//! {"kind":"request","id":7,"call":{"method":"heartbeat","params":{...}}}
//! {"kind":"response","id":7,"reply":{"type":"heartbeat","data":{...}}}
//! {"kind":"event","event":{"type":"recent_activity","data":{...}}}
//! ```
//!
//! Requests and responses are correlated by `id`, which is unique per
//! connection. Events are server push and carry no id.

use ferry_core::status::ServiceStatus;
use ferry_core::transfer::TransferAttempt;
use ferry_core::types::Timestamp;
use ferry_events::FerryEvent;
use serde::{Deserialize, Serialize};

/// Deadline for a permission request before it counts as a denial.
pub const PERMISSION_DEADLINE_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request { id: u64, call: Request },
    Response { id: u64, reply: Reply },
    Event { event: FerryEvent },
}

/// Parse a text frame.
///
/// Returns `Err` for malformed JSON or unknown kinds. Callers should log
/// and continue.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Correlation id of a request frame whose call could not be decoded.
///
/// Lets the receiver answer a malformed call with [`Reply::Error`] instead
/// of leaving the caller waiting for its deadline.
pub fn request_id_of(text: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("kind")?.as_str()? != "request" {
        return None;
    }
    value.get("id")?.as_u64()
}

/// Serialize a frame for sending.
pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// All calls a peer can make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    RequestPermission(PermissionRequest),
    HealthCheck(HealthCheckRequest),
    Status,
    TogglePause { paused: bool },
    ClearHistory,
    RecentHistory { limit: i64, current_session_only: bool },
    Register(RegisterRequest),
    Heartbeat(HeartbeatRequest),
}

impl Request {
    /// Method name used in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::RequestPermission(_) => "request_permission",
            Self::HealthCheck(_) => "health_check",
            Self::Status => "status",
            Self::TogglePause { .. } => "toggle_pause",
            Self::ClearHistory => "clear_history",
            Self::RecentHistory { .. } => "recent_history",
            Self::Register(_) => "register",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    /// Whether this call is session traffic from the peer.
    pub fn is_session_traffic(&self) -> bool {
        matches!(self, Self::Register(_) | Self::Heartbeat(_))
    }
}

/// Ask the peer whether a file may be moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub file_name: String,
    pub source_path: String,
    pub destination_path: String,
    pub rule_name: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Process/user identity, e.g. `monitor@alice`.
    pub identity: String,
    /// Random id of this registrant instance.
    pub instance_id: String,
    /// Replace an existing holder instead of being rejected.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub instance_id: String,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// All replies. Each request kind has exactly one success reply kind;
/// any request may be answered with [`Reply::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Permission(PermissionResponse),
    Health(HealthCheckResponse),
    Status(ServiceStatus),
    TogglePause { success: bool, paused: bool },
    ClearHistory { removed: u64 },
    RecentHistory { attempts: Vec<TransferAttempt> },
    Register(RegisterResponse),
    Heartbeat(HeartbeatResponse),
    Error { message: String },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Reply kind used in logs and mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Permission(_) => "permission",
            Self::Health(_) => "health",
            Self::Status(_) => "status",
            Self::TogglePause { .. } => "toggle_pause",
            Self::ClearHistory { .. } => "clear_history",
            Self::RecentHistory { .. } => "recent_history",
            Self::Register(_) => "register",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub allowed: bool,
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub healthy: bool,
    pub timestamp: Timestamp,
    pub uptime_secs: u64,
    /// Resident memory, when the platform reports it.
    pub memory_bytes: Option<u64>,
}

/// The current session holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub identity: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    /// The holder after this call: the caller when accepted, otherwise
    /// whoever blocked the registration.
    pub holder: Option<HolderInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    /// Whether the caller is still the recognized holder.
    pub is_owner: bool,
    pub holder: Option<HolderInfo>,
}
