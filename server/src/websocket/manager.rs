//! WebSocket connection manager.
//!
//! Tracks active connections, the session each one speaks for, and which
//! topics each one is subscribed to.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tessera_engine::{CollectionId, SessionId, WireMessage};
use tokio::sync::mpsc;

use super::addressed;

/// Sender for outgoing frames.
pub type MessageSender = mpsc::UnboundedSender<WireMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Session the client announced on upgrade
    pub session_id: SessionId,
    /// Channel to send frames to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Subscribed connection IDs per topic.
    topics: DashMap<CollectionId, HashSet<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, session_id: SessionId, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                session_id,
                sender,
            },
        );

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection and drop its subscriptions.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            self.topics.retain(|_, subscribers| {
                subscribers.remove(conn_id);
                !subscribers.is_empty()
            });

            tracing::info!(conn_id = %conn_id, session = %conn.session_id, "WebSocket connection unregistered");
        }
    }

    /// Session the connection speaks for.
    pub fn session_of(&self, conn_id: &str) -> Option<SessionId> {
        self.connections
            .get(conn_id)
            .map(|conn| conn.session_id.clone())
    }

    /// Subscribe a connection to a topic.
    ///
    /// Returns false if it was already subscribed.
    pub fn subscribe(&self, conn_id: &str, topic: &str) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id.to_string())
    }

    /// Remove a connection from a topic.
    pub fn unsubscribe(&self, conn_id: &str, topic: &str) -> bool {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(conn_id);
        if subscribers.is_empty() {
            drop(subscribers);
            self.topics.remove(topic);
        }
        removed
    }

    /// Send a frame to one connection, addressed to its session.
    pub fn send_to(&self, conn_id: &str, message: WireMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn
                .sender
                .send(addressed(message, &conn.session_id))
                .is_ok(),
            None => false,
        }
    }

    /// Send a frame to every subscriber of a topic except one connection.
    ///
    /// Returns the number of connections that received the frame.
    pub fn publish(&self, topic: &str, except: &str, message: &WireMessage) -> usize {
        let recipients: Vec<String> = match self.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|id| id.as_str() != except)
                .cloned()
                .collect(),
            None => return 0,
        };

        let sent_count = recipients
            .iter()
            .filter(|id| self.send_to(id, message.clone()))
            .count();

        tracing::debug!(
            topic = %topic,
            sender = %except,
            recipients = sent_count,
            "Published frame to subscribers"
        );

        sent_count
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of subscribers of a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
