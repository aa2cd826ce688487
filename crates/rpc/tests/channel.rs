//! End-to-end tests of the RPC channel over loopback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use ferry_events::{EventBus, FerryEvent};
use ferry_rpc::messages::{PermissionRequest, PermissionResponse, Reply, Request};
use ferry_rpc::reconnect::ReconnectConfig;
use ferry_rpc::{
    serve, ConnectionManager, ConnectionSnapshot, ConnectionState, ManagerConfig, RpcError,
    RpcHandler, SessionClient, SessionConfig, SessionRegistry, SessionRole,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct TestHandler {
    registry: SessionRegistry,
}

impl TestHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(Duration::from_secs(30)),
        })
    }
}

#[async_trait]
impl RpcHandler for TestHandler {
    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::RequestPermission(req) if req.file_name.starts_with("slow") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Reply::Permission(PermissionResponse::allow())
            }
            Request::RequestPermission(req) if req.file_name.starts_with("deny") => {
                Reply::Permission(PermissionResponse::deny("not today"))
            }
            Request::RequestPermission(_) => Reply::Permission(PermissionResponse::allow()),
            Request::Register(req) => Reply::Register(self.registry.register(&req, Instant::now())),
            Request::Heartbeat(req) => {
                Reply::Heartbeat(self.registry.heartbeat(&req, Instant::now()))
            }
            other => Reply::error(format!("unsupported: {}", other.method())),
        }
    }
}

fn permission(file: &str) -> PermissionRequest {
    PermissionRequest {
        file_name: file.into(),
        source_path: format!("/in/{file}"),
        destination_path: format!("/out/{file}"),
        rule_name: "Docs".into(),
        file_size: 10,
    }
}

fn fast_config(url: String) -> ManagerConfig {
    ManagerConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
        },
        reactive_debounce: Duration::from_secs(30),
        ..ManagerConfig::new("test", url)
    }
}

/// Start a server on an ephemeral port; returns its URL.
async fn start_server(
    handler: Arc<dyn RpcHandler>,
    bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let task = tokio::spawn(serve(listener, handler, bus, cancel));
    (url, task)
}

/// A loopback address nothing listens on.
async fn unused_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionSnapshot>,
    pred: impl FnMut(&ConnectionSnapshot) -> bool,
) -> ConnectionSnapshot {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("state not reached in time")
        .expect("manager stopped")
        .clone()
}

// ---------------------------------------------------------------------------
// Calls and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn calls_round_trip_and_events_are_rebroadcast() {
    let cancel = CancellationToken::new();
    let bus = Arc::new(EventBus::default());
    let (url, server) = start_server(TestHandler::new(), Some(Arc::clone(&bus)), cancel.clone()).await;

    let (manager, driver) = ConnectionManager::spawn(fast_config(url), cancel.clone());
    assert!(manager.connect().await);
    assert_eq!(manager.state().state, ConnectionState::Connected);

    assert!(manager.ask_permission(permission("a.txt")).await.unwrap().allowed);
    let denied = manager.ask_permission(permission("deny.txt")).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.message.as_deref(), Some("not today"));

    // Error replies surface as remote errors.
    assert_matches!(
        manager.health_check(Duration::from_secs(2)).await,
        Err(RpcError::Remote(msg)) if msg.contains("health_check")
    );

    let mut events = manager.subscribe_events();
    bus.publish(FerryEvent::activity("Docs: moved a.txt"));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_matches!(event, FerryEvent::RecentActivity { line, .. } if line == "Docs: moved a.txt");

    cancel.cancel();
    driver.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn undecodable_request_gets_an_error_reply() {
    use futures::{SinkExt, StreamExt};
    use ferry_rpc::messages::{parse_frame, Frame};
    use tokio_tungstenite::tungstenite::Message;

    let cancel = CancellationToken::new();
    let (url, _server) = start_server(TestHandler::new(), None, cancel.clone()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(
        r#"{"kind":"request","id":5,"call":{"method":"launch_rockets"}}"#.into(),
    ))
    .await
    .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no reply to malformed request");

    assert_matches!(
        parse_frame(&text).unwrap(),
        Frame::Response { id: 5, reply: Reply::Error { message } } if message.contains("Malformed")
    );
    cancel.cancel();
}

#[tokio::test]
async fn timed_out_call_is_denied_and_channel_recycled() {
    let cancel = CancellationToken::new();
    let (url, _server) = start_server(TestHandler::new(), None, cancel.clone()).await;

    let (manager, _driver) = ConnectionManager::spawn(fast_config(url), cancel.clone());
    assert!(manager.connect().await);
    let first_success = manager.state().last_success;
    let mut state = manager.watch_state();

    let result = manager
        .call(Request::RequestPermission(permission("slow.txt")), Duration::from_millis(100))
        .await;
    assert_matches!(result, Err(RpcError::Timeout));

    // A fresh channel replaces the unresponsive one.
    let back = wait_for_state(&mut state, |s| {
        s.state == ConnectionState::Connected && s.last_success != first_success
    })
    .await;
    assert_eq!(back.attempt, 0);

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Backoff and reactive reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_until_endpoint_appears_then_resets_backoff() {
    let cancel = CancellationToken::new();
    let addr = unused_addr().await;

    let (manager, _driver) =
        ConnectionManager::spawn(fast_config(format!("ws://{addr}")), cancel.clone());
    assert!(!manager.connect().await);
    let mut state = manager.watch_state();

    let failing = wait_for_state(&mut state, |s| s.attempt >= 2).await;
    assert!(failing.last_error.is_some());

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(serve(listener, TestHandler::new(), None, cancel.clone()));

    let connected = wait_for_state(&mut state, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(connected.attempt, 0);
    assert!(connected.last_success.is_some());

    cancel.cancel();
}

#[tokio::test]
async fn peer_contact_bypasses_backoff() {
    let cancel = CancellationToken::new();
    let addr = unused_addr().await;

    let config = ManagerConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(600),
            max_delay: Duration::from_secs(600),
            ..ReconnectConfig::default()
        },
        ..fast_config(format!("ws://{addr}"))
    };
    let (manager, _driver) = ConnectionManager::spawn(config, cancel.clone());
    assert!(!manager.connect().await);
    assert_eq!(manager.state().state, ConnectionState::Reconnecting);

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(serve(listener, TestHandler::new(), None, cancel.clone()));

    manager.peer_contacted();
    let mut state = manager.watch_state();
    wait_for_state(&mut state, |s| s.state == ConnectionState::Connected).await;

    // Already connected: a further contact changes nothing.
    manager.peer_contacted();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state().state, ConnectionState::Connected);

    cancel.cancel();
}

#[tokio::test]
async fn reactive_trigger_is_debounced() {
    let cancel = CancellationToken::new();
    let addr = unused_addr().await;

    let config = ManagerConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(600),
            max_delay: Duration::from_secs(600),
            ..ReconnectConfig::default()
        },
        ..fast_config(format!("ws://{addr}"))
    };
    let (manager, _driver) = ConnectionManager::spawn(config, cancel.clone());
    assert!(!manager.connect().await);
    assert_eq!(manager.state().attempt, 1);

    let mut state = manager.watch_state();
    manager.peer_contacted();
    wait_for_state(&mut state, |s| s.attempt == 2).await;

    manager.peer_contacted();
    manager.peer_contacted();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.state().attempt, 2);

    cancel.cancel();
}

#[tokio::test]
async fn explicit_disconnect_stops_reconnecting() {
    let cancel = CancellationToken::new();
    let (url, _server) = start_server(TestHandler::new(), None, cancel.clone()).await;

    let (manager, _driver) = ConnectionManager::spawn(fast_config(url), cancel.clone());
    assert!(manager.connect().await);

    manager.disconnect();
    let mut state = manager.watch_state();
    wait_for_state(&mut state, |s| s.state == ConnectionState::Disconnected).await;

    manager.peer_contacted();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.state().state, ConnectionState::Disconnected);
    assert_matches!(
        manager.call(Request::Status, Duration::from_secs(1)).await,
        Err(RpcError::NotConnected)
    );

    cancel.cancel();
}

#[tokio::test]
async fn server_shutdown_moves_client_to_reconnecting() {
    let server_cancel = CancellationToken::new();
    let (url, server) = start_server(TestHandler::new(), None, server_cancel.clone()).await;

    let cancel = CancellationToken::new();
    let (manager, _driver) = ConnectionManager::spawn(fast_config(url), cancel.clone());
    assert!(manager.connect().await);

    server_cancel.cancel();
    server.await.unwrap();

    let mut state = manager.watch_state();
    wait_for_state(&mut state, |s| s.state != ConnectionState::Connected).await;
    let denied = manager.request_permission(permission("a.txt")).await;
    assert!(!denied.allowed);

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Session protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_registrant_stands_by() {
    let cancel = CancellationToken::new();
    let (url, _server) = start_server(TestHandler::new(), None, cancel.clone()).await;

    let (first_mgr, _) = ConnectionManager::spawn(fast_config(url.clone()), cancel.clone());
    assert!(first_mgr.connect().await);
    let (first, _) = SessionClient::spawn(
        first_mgr,
        SessionConfig::new("monitor@first", Duration::from_millis(100)),
        cancel.clone(),
    );
    let mut first_role = first.watch_role();
    tokio::time::timeout(Duration::from_secs(5), first_role.wait_for(|r| r.is_owner()))
        .await
        .unwrap()
        .unwrap();

    let (second_mgr, _) = ConnectionManager::spawn(fast_config(url), cancel.clone());
    assert!(second_mgr.connect().await);
    let (second, _) = SessionClient::spawn(
        second_mgr,
        SessionConfig::new("monitor@second", Duration::from_millis(100)),
        cancel.clone(),
    );
    let mut second_role = second.watch_role();
    let role = tokio::time::timeout(
        Duration::from_secs(5),
        second_role.wait_for(|r| matches!(r, SessionRole::Standby(_))),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();

    assert_matches!(role, SessionRole::Standby(holder) if holder.identity == "monitor@first");
    assert!(first.role().is_owner());

    cancel.cancel();
}
