//! WebSocket support for real-time sync.
//!
//! Clients connect once per session and exchange `WireMessage` frames. The
//! manager routes relays to the subscribers of a topic.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
