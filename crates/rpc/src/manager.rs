//! Resilient outbound RPC channel.
//!
//! [`ConnectionManager`] maintains one logical WebSocket channel to a fixed
//! local endpoint. A single driver task owns the socket and the connection
//! state; the cloneable handle talks to it through a command channel and
//! observes state through a `watch` channel.
//!
//! On failure the driver schedules a reconnect using the backoff in
//! [`reconnect`](crate::reconnect). [`ConnectionManager::peer_contacted`]
//! bypasses the backoff for one immediate attempt (debounced, and a no-op
//! while connected). Calls made while disconnected fail fast with
//! [`RpcError::NotConnected`]; typed helpers map failures to a safe
//! default.
//!
//! Events pushed by the remote side are re-broadcast to local subscribers.

use std::collections::HashMap;
use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ferry_core::types::Timestamp;
use ferry_events::FerryEvent;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{connect, send_frame, ClientStream};
use crate::error::RpcError;
use crate::messages::{
    parse_frame, Frame, HealthCheckRequest, HealthCheckResponse, HeartbeatRequest,
    HeartbeatResponse, PermissionRequest, PermissionResponse, RegisterRequest, RegisterResponse,
    Reply, Request, PERMISSION_DEADLINE_SECS,
};
use crate::reconnect::{next_delay, ReconnectConfig};

/// Broadcast channel capacity for re-broadcast remote events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for a clean close handshake on teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Connection state, owned exclusively by the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Apply a transition.
    ///
    /// An explicit disconnect always wins. While disconnected, only a new
    /// connect attempt leaves the state; loss and retry events are ignored.
    pub fn apply(self, transition: Transition) -> Self {
        use ConnectionState::*;
        match (self, transition) {
            (_, Transition::DisconnectRequested) => Disconnected,
            (Connected, Transition::AttemptStarted) => Connected,
            (_, Transition::AttemptStarted) => Connecting,
            (Connecting, Transition::AttemptSucceeded) => Connected,
            (Connecting, Transition::AttemptFailed) => Failed,
            (Connected, Transition::ChannelLost) => Reconnecting,
            (Failed | Connecting, Transition::RetryScheduled) => Reconnecting,
            (state, _) => state,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`ConnectionState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    AttemptStarted,
    AttemptSucceeded,
    AttemptFailed,
    RetryScheduled,
    ChannelLost,
    DisconnectRequested,
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last success.
    pub attempt: u32,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_success: None,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for one managed channel.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Label used in log fields (e.g. `approval`, `control`).
    pub name: String,
    /// WebSocket URL of the local endpoint.
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Minimum spacing between reactive reconnect attempts.
    pub reactive_debounce: Duration,
}

impl ManagerConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            reactive_debounce: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type ReplySender = oneshot::Sender<Result<Reply, RpcError>>;

enum Command {
    Connect { reply: oneshot::Sender<bool> },
    Disconnect,
    Reconnect,
    PeerContacted,
    Call { id: u64, request: Request, reply: ReplySender },
    CallTimedOut { id: u64 },
}

/// Cloneable handle to a managed channel.
#[derive(Clone)]
pub struct ConnectionManager {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<FerryEvent>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Spawn the driver task. It starts `Disconnected`; call
    /// [`connect`](Self::connect) to bring the channel up.
    ///
    /// The task exits when `cancel` fires or every handle is dropped.
    pub fn spawn(
        config: ManagerConfig,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handle = Self {
            name: Arc::from(config.name.as_str()),
            commands: cmd_tx,
            state: state_rx,
            events: event_tx.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let driver = Driver {
            config,
            snapshot: ConnectionSnapshot::default(),
            state_tx,
            events: event_tx,
            pending: HashMap::new(),
            connect_waiters: Vec::new(),
            auto_reconnect: false,
            retry_at: None,
            last_reactive: None,
        };
        let task = tokio::spawn(driver.run(cmd_rx, cancel));

        (handle, task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the channel up and keep it up.
    ///
    /// Returns whether this attempt connected. On failure the manager keeps
    /// retrying in the background with backoff.
    pub async fn connect(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Connect { reply: tx }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close the channel and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Drop the current channel (if any) and connect again immediately.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Reactive trigger: the remote side just contacted us, so it is
    /// probably reachable now.
    pub fn peer_contacted(&self) {
        let _ = self.commands.send(Command::PeerContacted);
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().state == ConnectionState::Connected
    }

    /// Receiver that changes on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    /// Events pushed by the remote side.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FerryEvent> {
        self.events.subscribe()
    }

    /// Make one call, waiting at most `deadline` for the reply.
    ///
    /// A timed-out call also recycles the channel, since a peer that stops
    /// answering is indistinguishable from a dead one.
    pub async fn call(&self, request: Request, deadline: Duration) -> Result<Reply, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                id,
                request,
                reply: tx,
            })
            .map_err(|_| RpcError::Shutdown)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Shutdown),
            Err(_) => {
                let _ = self.commands.send(Command::CallTimedOut { id });
                Err(RpcError::Timeout)
            }
        }
    }

    /// Ask the peer for permission to move a file.
    pub async fn ask_permission(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionResponse, RpcError> {
        let deadline = Duration::from_secs(PERMISSION_DEADLINE_SECS);
        match self.call(Request::RequestPermission(request), deadline).await? {
            Reply::Permission(response) => Ok(response),
            other => Err(unexpected("permission", other)),
        }
    }

    /// Like [`ask_permission`](Self::ask_permission), but any failure is a
    /// denial.
    pub async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse {
        match self.ask_permission(request).await {
            Ok(response) => response,
            Err(e) => PermissionResponse::deny(format!("Peer unavailable: {e}")),
        }
    }

    pub async fn register(
        &self,
        request: RegisterRequest,
        deadline: Duration,
    ) -> Result<RegisterResponse, RpcError> {
        match self.call(Request::Register(request), deadline).await? {
            Reply::Register(response) => Ok(response),
            other => Err(unexpected("register", other)),
        }
    }

    pub async fn heartbeat(
        &self,
        request: HeartbeatRequest,
        deadline: Duration,
    ) -> Result<HeartbeatResponse, RpcError> {
        match self.call(Request::Heartbeat(request), deadline).await? {
            Reply::Heartbeat(response) => Ok(response),
            other => Err(unexpected("heartbeat", other)),
        }
    }

    pub async fn health_check(&self, deadline: Duration) -> Result<HealthCheckResponse, RpcError> {
        let request = HealthCheckRequest {
            timestamp: Utc::now(),
        };
        match self.call(Request::HealthCheck(request), deadline).await? {
            Reply::Health(response) => Ok(response),
            other => Err(unexpected("health", other)),
        }
    }
}

fn unexpected(expected: &'static str, reply: Reply) -> RpcError {
    match reply {
        Reply::Error { message } => RpcError::Remote(message),
        other => RpcError::UnexpectedReply {
            expected,
            got: other.kind(),
        },
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type ConnectFuture = BoxFuture<'static, Result<ClientStream, RpcError>>;

struct Driver {
    config: ManagerConfig,
    snapshot: ConnectionSnapshot,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<FerryEvent>,
    pending: HashMap<u64, ReplySender>,
    connect_waiters: Vec<oneshot::Sender<bool>>,
    /// Cleared by an explicit disconnect.
    auto_reconnect: bool,
    retry_at: Option<Instant>,
    last_reactive: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        tracing::info!(channel = %self.config.name, url = %self.config.url, "Connection manager started");

        let mut socket: Option<ClientStream> = None;
        let mut connecting: Option<ConnectFuture> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut socket, &mut connecting).await,
                    None => break,
                },
                result = poll_connect(&mut connecting) => {
                    connecting = None;
                    self.on_connect_result(result, &mut socket);
                }
                msg = next_message(&mut socket) => self.on_message(msg, &mut socket),
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    if connecting.is_none() && socket.is_none() {
                        connecting = Some(self.start_attempt());
                    }
                }
            }
        }

        if let Some(mut ws) = socket.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
        }
        self.fail_pending(|| RpcError::Shutdown);
        self.resolve_waiters(false);
        self.transition(Transition::DisconnectRequested);
        tracing::info!(channel = %self.config.name, "Connection manager stopped");
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        socket: &mut Option<ClientStream>,
        connecting: &mut Option<ConnectFuture>,
    ) {
        match cmd {
            Command::Connect { reply } => {
                self.auto_reconnect = true;
                if socket.is_some() {
                    let _ = reply.send(true);
                    return;
                }
                self.connect_waiters.push(reply);
                if connecting.is_none() {
                    self.retry_at = None;
                    *connecting = Some(self.start_attempt());
                }
            }
            Command::Disconnect => {
                self.auto_reconnect = false;
                self.retry_at = None;
                *connecting = None;
                if let Some(mut ws) = socket.take() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                }
                self.fail_pending(|| RpcError::NotConnected);
                self.resolve_waiters(false);
                self.transition(Transition::DisconnectRequested);
                tracing::info!(channel = %self.config.name, "Disconnected on request");
            }
            Command::Reconnect => {
                self.auto_reconnect = true;
                if let Some(mut ws) = socket.take() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                    self.fail_pending(|| RpcError::ConnectionLost);
                    self.transition(Transition::ChannelLost);
                }
                if connecting.is_none() {
                    self.retry_at = None;
                    *connecting = Some(self.start_attempt());
                }
            }
            Command::PeerContacted => {
                if socket.is_some() || connecting.is_some() {
                    tracing::trace!(channel = %self.config.name, "Peer contact ignored, channel up or connecting");
                    return;
                }
                if !self.auto_reconnect {
                    tracing::debug!(channel = %self.config.name, "Peer contact ignored, channel disconnected on request");
                    return;
                }
                let now = Instant::now();
                if let Some(last) = self.last_reactive {
                    if now.duration_since(last) < self.config.reactive_debounce {
                        tracing::debug!(channel = %self.config.name, "Reactive reconnect debounced");
                        return;
                    }
                }
                self.last_reactive = Some(now);
                self.retry_at = None;
                tracing::info!(channel = %self.config.name, "Peer contacted us, reconnecting immediately");
                *connecting = Some(self.start_attempt());
            }
            Command::Call { id, request, reply } => {
                self.pending.retain(|_, tx| !tx.is_closed());
                let Some(ws) = socket.as_mut() else {
                    let _ = reply.send(Err(RpcError::NotConnected));
                    return;
                };
                let frame = Frame::Request { id, call: request };
                match send_frame(ws, &frame).await {
                    Ok(()) => {
                        self.pending.insert(id, reply);
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.config.name, error = %e, "Send failed");
                        let _ = reply.send(Err(RpcError::ConnectionLost));
                        self.channel_lost(socket, &e.to_string());
                    }
                }
            }
            Command::CallTimedOut { id } => {
                if self.pending.remove(&id).is_some() && socket.is_some() {
                    self.channel_lost(socket, "call timed out");
                }
            }
        }
    }

    fn start_attempt(&mut self) -> ConnectFuture {
        self.transition(Transition::AttemptStarted);
        tracing::debug!(
            channel = %self.config.name,
            attempt = self.snapshot.attempt + 1,
            "Connecting",
        );
        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout;
        async move { connect(&url, timeout).await }.boxed()
    }

    fn on_connect_result(
        &mut self,
        result: Result<ClientStream, RpcError>,
        socket: &mut Option<ClientStream>,
    ) {
        match result {
            Ok(ws) => {
                *socket = Some(ws);
                let previous_failures = self.snapshot.attempt;
                self.snapshot.attempt = 0;
                self.snapshot.last_success = Some(Utc::now());
                self.snapshot.last_error = None;
                self.transition(Transition::AttemptSucceeded);
                self.resolve_waiters(true);
                tracing::info!(
                    channel = %self.config.name,
                    previous_failures,
                    "Connected",
                );
            }
            Err(e) => {
                self.snapshot.attempt = self.snapshot.attempt.saturating_add(1);
                self.snapshot.last_error = Some(e.to_string());
                self.transition(Transition::AttemptFailed);
                self.resolve_waiters(false);
                tracing::warn!(
                    channel = %self.config.name,
                    attempt = self.snapshot.attempt,
                    error = %e,
                    "Connection attempt failed",
                );
                self.schedule_retry();
            }
        }
    }

    fn on_message(
        &mut self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        socket: &mut Option<ClientStream>,
    ) {
        match msg {
            Some(Ok(Message::Text(text))) => {
                tracing::debug!(target: "ferry_rpc::inbound", frame = %text);
                match parse_frame(&text) {
                    Ok(Frame::Response { id, reply }) => match self.pending.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(Ok(reply));
                        }
                        None => {
                            tracing::debug!(channel = %self.config.name, id, "Late response dropped");
                        }
                    },
                    Ok(Frame::Event { event }) => {
                        let _ = self.events.send(event);
                    }
                    Ok(Frame::Request { id, call }) => {
                        tracing::warn!(
                            channel = %self.config.name,
                            id,
                            method = call.method(),
                            "Unexpected request on client channel",
                        );
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.config.name, error = %e, "Malformed frame");
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(channel = %self.config.name, ?frame, "Remote closed channel");
                self.channel_lost(socket, "closed by remote");
            }
            Some(Ok(_)) => {
                // Ping / Pong / Binary: handled by tungstenite or ignored.
            }
            Some(Err(e)) => self.channel_lost(socket, &e.to_string()),
            None => self.channel_lost(socket, "stream ended"),
        }
    }

    fn channel_lost(&mut self, socket: &mut Option<ClientStream>, reason: &str) {
        *socket = None;
        self.fail_pending(|| RpcError::ConnectionLost);
        self.snapshot.attempt = self.snapshot.attempt.saturating_add(1);
        self.snapshot.last_error = Some(reason.to_string());
        self.transition(Transition::ChannelLost);
        tracing::warn!(channel = %self.config.name, reason, "Channel lost");
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if !self.auto_reconnect {
            return;
        }
        let delay = next_delay(self.snapshot.attempt, &self.config.reconnect);
        self.retry_at = Some(Instant::now() + delay);
        self.transition(Transition::RetryScheduled);
        tracing::info!(
            channel = %self.config.name,
            attempt = self.snapshot.attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled",
        );
    }

    fn transition(&mut self, transition: Transition) {
        let next = self.snapshot.state.apply(transition);
        if next != self.snapshot.state {
            tracing::debug!(
                channel = %self.config.name,
                from = %self.snapshot.state,
                to = %next,
                "Connection state changed",
            );
        }
        self.snapshot.state = next;
        self.state_tx.send_replace(self.snapshot.clone());
    }

    fn fail_pending(&mut self, error: impl Fn() -> RpcError) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(error()));
        }
    }

    fn resolve_waiters(&mut self, connected: bool) {
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(connected);
        }
    }
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> Result<ClientStream, RpcError> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_message(
    socket: &mut Option<ClientStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
