//! WebSocket handler: one task per canvas connection.
//!
//! DESIGN
//! ======
//! On upgrade the task registers with the hub, then runs a `select!` loop:
//! - Incoming text is parsed into a typed event and forwarded to the hub.
//! - Frames the hub queued for this connection are written to the socket.
//!
//! The task never touches canvas state. When the hub drops this session
//! (eviction or a newer connection claiming the identity) the outbound queue
//! closes and the loop ends.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → hub `connect` → `session:assigned` + `canvas:state`
//! 2. Client frames → `protocol::parse_inbound` → hub event
//! 3. Close, error, or eviction → hub `disconnect` → peers see `user:left`

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::protocol;
use crate::services::hub::{ConnectError, OUTBOUND_QUEUE_CAPACITY};
use crate::state::{AppState, ConnectionId};

/// Largest inbound message accepted from a client.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let requested_identity = params.get("identity").cloned();
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| run_ws(socket, state, requested_identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, requested_identity: Option<String>) {
    let connection_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_CAPACITY);

    let assigned = match state.hub.connect(connection_id, requested_identity, client_tx).await {
        Ok(assigned) => assigned,
        Err(ConnectError::ConnectionLimit { limit }) => {
            warn!(%connection_id, limit, "ws: refusing connection; server full");
            let close = CloseFrame { code: close_code::AGAIN, reason: "server full".into() };
            let _ = socket.send(Message::Close(Some(close))).await;
            return;
        }
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: hub unavailable");
            return;
        }
    };

    info!(%connection_id, identity = %assigned.identity, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => dispatch_text(&state, connection_id, text.as_str()).await,
                    Message::Ping(_) => state.hub.heartbeat(connection_id).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = client_rx.recv() => {
                let Some(frame) = frame else {
                    info!(%connection_id, identity = %assigned.identity, "ws: session dropped by hub");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.disconnect(connection_id).await;
    info!(%connection_id, identity = %assigned.identity, "ws: client disconnected");
}

/// Parse one text message and hand it to the hub. Invalid input is dropped.
async fn dispatch_text(state: &AppState, connection_id: ConnectionId, text: &str) {
    match protocol::parse_inbound(text, &state.config.limits) {
        Ok(inbound) => state.hub.event(connection_id, inbound).await,
        Err(e) => debug!(%connection_id, error = %e, "ws: dropped inbound frame"),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(syscall = %frame.syscall, error = %e, "ws: failed to encode frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
