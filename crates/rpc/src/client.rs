//! WebSocket client side of the RPC channel.
//!
//! [`connect`] opens one socket to a fixed local endpoint. The
//! [`ConnectionManager`](crate::manager::ConnectionManager) owns the
//! resulting stream and drives it; nothing else touches it.

use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::RpcError;
use crate::messages::{encode_frame, Frame};

/// The raw client-side stream.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to `url`, giving up after `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<ClientStream, RpcError> {
    let attempt = tokio::time::timeout(timeout, connect_async(url));
    let (ws_stream, _response) = attempt
        .await
        .map_err(|_| RpcError::Connect(format!("Timed out connecting to {url}")))?
        .map_err(|e| RpcError::Connect(format!("Failed to connect to {url}: {e}")))?;

    tracing::debug!(url, "WebSocket handshake complete");
    Ok(ws_stream)
}

/// Serialize and send one frame, logging it as outbound traffic.
pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), RpcError>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = encode_frame(frame)?;
    tracing::debug!(target: "ferry_rpc::outbound", frame = %json);
    sink.send(Message::Text(json)).await?;
    Ok(())
}
