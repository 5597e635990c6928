//! Upstream socket plumbing.
//!
//! Only the leader peer ever opens one of these. The coordinator owns the
//! read/write loop; this module provides the connect step and the command
//! type the coordinator uses to drive the writer half.

use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ClientResult;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands from the coordinator to the socket task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the connection and end the task.
    Close,
}

/// Open the upstream connection.
pub(crate) async fn connect(url: &str) -> ClientResult<WsStream> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

/// Render an opaque send payload as frame text: strings go through
/// verbatim, everything else is JSON-encoded.
pub(crate) fn payload_to_text(payload: &serde_json::Value) -> String {
    match payload.as_str() {
        Some(text) => text.to_string(),
        None => payload.to_string(),
    }
}
