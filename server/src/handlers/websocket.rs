//! WebSocket handler for real-time sync.
//!
//! Handles WebSocket connections and applies incoming frames to the
//! authority, answering the sender and relaying to topic subscribers.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tessera_engine::{Operation, SessionId, WireMessage};
use tokio::sync::mpsc;

use crate::websocket::{is_client_operation, rejection};
use crate::{now_millis, AppState};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Processes incoming frames in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, session_id: SessionId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    let conn_manager = state.conn_manager.clone();
    let conn_id = conn_manager.register(session_id.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        session = %session_id,
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.encode() {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                process_frame(&text, &state, &conn_id, &session_id);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        session = %session_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Apply one inbound frame.
pub(crate) fn process_frame(text: &str, state: &AppState, conn_id: &str, session_id: &str) {
    let frame = match WireMessage::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, "Dropping malformed frame: {}", e);
            return;
        }
    };

    let conns = &state.conn_manager;

    if frame.session_id != session_id {
        tracing::warn!(
            conn_id = %conn_id,
            expected = %session_id,
            received = %frame.session_id,
            "Session mismatch, rejecting frame"
        );
        conns.send_to(conn_id, rejection(&frame));
        return;
    }

    if !is_client_operation(frame.operation) {
        tracing::warn!(conn_id = %conn_id, operation = %frame.operation, "Ignoring server-only operation");
        return;
    }

    let topic = frame.store_id.clone();

    match frame.operation {
        Operation::Get => {
            conns.subscribe(conn_id, &topic);
            let ids = frame.ids();
            let models = state.authority.get(&topic, &ids);
            tracing::debug!(collection = %topic, requested = ids.len(), returned = models.len(), "Answering fetch");

            let reply = if ids.is_empty() {
                WireMessage::response(topic, models, session_id)
            } else {
                WireMessage::update(topic, models, session_id)
            };
            conns.send_to(conn_id, reply);
        }

        Operation::Set => {
            conns.subscribe(conn_id, &topic);
            let stored = state.authority.set(&topic, frame.into_models(), now_millis());
            if stored.is_empty() {
                return;
            }

            let update = WireMessage::update(topic.clone(), stored, session_id);
            let relayed = conns.publish(&topic, conn_id, &update);
            tracing::debug!(collection = %topic, models = update.models().len(), relayed, "Accepted writes");
            conns.send_to(conn_id, update);
        }

        Operation::Delete => {
            let removed = state.authority.delete(&topic, &frame.ids());
            if removed.is_empty() {
                return;
            }

            let relay = WireMessage::delete(topic.clone(), &removed, session_id);
            let relayed = conns.publish(&topic, conn_id, &relay);
            tracing::debug!(collection = %topic, removed = removed.len(), relayed, "Accepted deletes");
        }

        Operation::Subscribe => {
            conns.subscribe(conn_id, &topic);
            conns.send_to(conn_id, WireMessage::subscribed(topic, session_id));
        }

        Operation::Unsubscribe => {
            conns.unsubscribe(conn_id, &topic);
        }

        Operation::Cmd | Operation::Broadcast => {
            let relayed = conns.publish(&topic, conn_id, &frame);
            tracing::debug!(topic = %topic, cmd = ?frame.cmd, relayed, "Relayed event");
        }

        Operation::Direct => {
            conns.send_to(conn_id, frame);
        }

        Operation::Ping => {
            tracing::trace!(conn_id = %conn_id, "Keepalive");
        }

        Operation::Response | Operation::List | Operation::Update | Operation::Subscribed => {}
    }
}
