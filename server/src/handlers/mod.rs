//! Request handlers for sync operations.

mod websocket;

pub use websocket::*;
