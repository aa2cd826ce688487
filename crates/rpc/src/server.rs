//! Inbound side of the RPC channel.
//!
//! [`serve`] accepts WebSocket connections on a TCP listener, dispatches
//! each request to an [`RpcHandler`] on its own task, and pushes every
//! event published on the [`EventBus`] to every connected client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_events::EventBus;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::messages::{encode_frame, parse_frame, request_id_of, Frame, Reply, Request};

/// How long connections get to wind down after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Answers requests arriving on the channel.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Reply;
}

/// Accept connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    tracing::info!(addr = %local, "RPC server listening");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let events = events.as_ref().map(|bus| bus.subscribe());
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        events,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            },
            // Reap finished connection tasks.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = connections.len(), "Aborting RPC connections after grace period");
        connections.abort_all();
    }
    tracing::info!(addr = %local, "RPC server stopped");
}

/// Drive one client connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RpcHandler>,
    events: Option<broadcast::Receiver<ferry_events::FerryEvent>>,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    tracing::info!(peer = %peer, "RPC client connected");

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Sender task: forward queued messages to the WebSocket sink.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Event task: push bus events to this client.
    let event_task = events.map(|mut events| {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !queue_frame(&tx, &Frame::Event { event }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event push lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    // Receiver loop: dispatch inbound requests.
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                tracing::debug!(target: "ferry_rpc::inbound", peer = %peer, frame = %text);
                match parse_frame(&text) {
                    Ok(Frame::Request { id, call }) => {
                        let handler = Arc::clone(&handler);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let reply = handler.handle(call).await;
                            let _ = queue_frame(&tx, &Frame::Response { id, reply });
                        });
                    }
                    Ok(other) => {
                        tracing::warn!(peer = %peer, frame = ?other, "Unexpected frame from client");
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Malformed frame");
                        if let Some(id) = request_id_of(&text) {
                            let reply = Reply::error(format!("Malformed request: {e}"));
                            let _ = queue_frame(&tx, &Frame::Response { id, reply });
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    if let Some(task) = event_task {
        task.abort();
    }
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), send_task).await;
    tracing::info!(peer = %peer, "RPC client disconnected");
}

/// Encode a frame onto a connection's outbound queue.
///
/// Returns `false` once the connection's sender task has gone away.
fn queue_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Frame) -> bool {
    let json = match encode_frame(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode frame");
            return true;
        }
    };
    tracing::debug!(target: "ferry_rpc::outbound", frame = %json);
    tx.send(Message::Text(json)).is_ok()
}
