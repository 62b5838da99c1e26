//! Frame helpers for the sync protocol.
//!
//! The frame format itself lives in `tessera_engine::WireMessage`; these are
//! the server-side shapes built from it.

use tessera_engine::{Operation, WireMessage, NOT_AUTHORIZED};

/// Re-address a frame to the session of the connection it is sent to.
pub fn addressed(mut message: WireMessage, session_id: &str) -> WireMessage {
    if message.session_id != session_id {
        message.session_id = session_id.to_string();
    }
    message
}

/// Rejection for a frame whose session does not match the connection.
pub fn rejection(frame: &WireMessage) -> WireMessage {
    let mut message = WireMessage::new(frame.store_id.clone(), frame.operation, frame.session_id.clone());
    message.error_code = Some(NOT_AUTHORIZED);
    message
}

/// Whether a client may send this operation to the server.
pub fn is_client_operation(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Get
            | Operation::Set
            | Operation::Delete
            | Operation::Cmd
            | Operation::Subscribe
            | Operation::Unsubscribe
            | Operation::Broadcast
            | Operation::Direct
            | Operation::Ping
    )
}
