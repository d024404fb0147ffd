//! WebSocket transport for participant signal streams
//!
//! Identity arrives as query parameters on the upgrade request
//! (`/ws?peer-id=..&room-id=..&name=..&role=host`). After the upgrade each
//! JSON text frame carries one [`Signal`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use huddle_sfu::{Error, Peer, PeerMetadata, Signal, SignalReader, SignalStream, SignalWriter};
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// Signaling frames are small; cap them well below axum's default
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Inbound half of a participant's WebSocket
struct WsReader {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalReader for WsReader {
    async fn recv(&mut self) -> Option<huddle_sfu::Result<Signal>> {
        loop {
            let decoded = match self.receiver.next().await? {
                Ok(Message::Text(text)) => serde_json::from_str::<Signal>(text.as_str()),
                Ok(Message::Binary(bytes)) => serde_json::from_slice::<Signal>(&bytes),
                Ok(Message::Close(_)) => return None,
                // Ping and pong are answered by axum
                Ok(_) => continue,
                Err(e) => return Some(Err(Error::Transport(format!("WebSocket error: {e}")))),
            };
            match decoded {
                Ok(signal) => return Some(Ok(signal)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed signal frame");
                }
            }
        }
    }
}

/// Outbound half of a participant's WebSocket
struct WsWriter {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SignalWriter for WsWriter {
    async fn send(&mut self, signal: Signal) -> huddle_sfu::Result<()> {
        let text = serde_json::to_string(&signal)?;
        self.sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {e}")))
    }
}

/// Upgrade a signaling connection
///
/// Missing or invalid identity parameters are rejected with 400 before the
/// upgrade.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let metadata = match PeerMetadata::from_pairs(
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    ) {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!(error = %e, "Rejecting signaling connection");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, metadata))
}

async fn handle_socket(socket: WebSocket, state: AppState, metadata: PeerMetadata) {
    let peer_id = metadata.peer_id.clone();
    let room_id = metadata.room_id.clone();
    info!(peer_id = %peer_id, room_id = %room_id, role = %metadata.role, "WebSocket connection established");

    let (sender, receiver) = socket.split();
    let stream = SignalStream::new(metadata, WsReader { receiver }, WsWriter { sender });

    let peer = match Peer::new(Arc::clone(&state.hub), stream).await {
        Ok(peer) => peer,
        Err(e) => {
            error!(peer_id = %peer_id, error = %e, "Failed to create peer");
            return;
        }
    };

    match peer.connect().await {
        Ok(()) => info!(peer_id = %peer_id, room_id = %room_id, "WebSocket connection closed"),
        Err(e) => warn!(peer_id = %peer_id, room_id = %room_id, error = %e, "WebSocket session ended with error"),
    }
}
