//! Rehearsal WebSocket endpoint.
//!
//! One task per connection reads frames and hands them to the engine; a
//! writer task drains the connection's outbound channel. Whichever side
//! finishes first ends the connection, and its sessions are torn down
//! exactly once.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::rehearsal::{ProtocolError, ServerMessage};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let engine = state.engine;
    let conn_id = engine.next_connection_id();
    info!(conn_id, "WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn_id, error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id, "WebSocket send failed, closing writer");
                break;
            }
        }
    });

    let reader_engine = engine.clone();
    let reader_outbound = outbound.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(conn_id, "WebSocket error: {}", e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    reader_engine
                        .handle_text(conn_id, &reader_outbound, text.as_str())
                        .await;
                }
                Message::Binary(data) => {
                    debug!(conn_id, bytes = data.len(), "Rejecting binary frame");
                    let _ = reader_outbound.send(ServerMessage::error(ProtocolError::Binary.to_string(), None));
                }
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    info!(conn_id, "WebSocket closed by client");
                    break;
                }
            }
        }
    });

    // The other task must be gone before cleanup, or a start still inside
    // it could register a session after `disconnect` has run.
    tokio::select! {
        _ = &mut reader => {
            writer.abort();
            let _ = writer.await;
        }
        _ = &mut writer => {
            reader.abort();
            let _ = reader.await;
        }
    }

    let ended = engine.disconnect(conn_id).await;
    info!(conn_id, sessions_ended = ended, "WebSocket connection closed");
}
