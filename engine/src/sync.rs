//! Sync session: the sans-IO half of the transport.
//!
//! The session owns the connection state machine, the reconnect and
//! keepalive deadlines and the topic subscription table. It never opens a
//! socket; the host does that when [`SyncSession::poll`] returns
//! [`LinkRequest::Connect`] and hands back a [`Link`] on success.
//!
//! ```text
//! Disconnected --poll (retry due)--> Connecting --opened--> Connected
//!      ^                                  |                     |
//!      +------------- closed -------------+---------------------+
//! ```

use crate::{
    notifier::SubscriptionId, schedule::earliest, CollectionId, SessionId, Timestamp, WireMessage,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay before reconnecting after a close.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Keepalive interval while connected.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// Outbound half of a live connection.
pub trait Link: Send {
    /// Queue one text frame.
    fn send(&mut self, frame: String) -> Result<(), LinkError>;
}

/// Failure to hand a frame to the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("send failed: {0}")]
    Failed(String),
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the host should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRequest {
    /// Open a connection and report back with `on_open` or `on_close`
    Connect,
}

/// Session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Frames with another session id are dropped
    pub session_id: SessionId,
    /// Milliseconds between a close and the next connect attempt
    pub reconnect_delay: u64,
    /// Milliseconds between keepalive pings
    pub ping_interval: u64,
}

impl SyncOptions {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY_MS,
            ping_interval: DEFAULT_PING_INTERVAL_MS,
        }
    }

    pub fn reconnect_delay(mut self, millis: u64) -> Self {
        self.reconnect_delay = millis;
        self
    }

    pub fn ping_interval(mut self, millis: u64) -> Self {
        self.ping_interval = millis;
        self
    }
}

type TopicCallback = Box<dyn FnMut(&WireMessage) + Send>;
type NotAuthorizedCallback = Box<dyn FnMut() + Send>;

/// Connection state machine and topic table.
pub struct SyncSession {
    options: SyncOptions,
    state: LinkState,
    link: Option<Box<dyn Link>>,
    closed_by_caller: bool,
    retry_at: Option<Timestamp>,
    next_ping_at: Option<Timestamp>,
    topics: IndexMap<CollectionId, IndexMap<SubscriptionId, TopicCallback>>,
    next_subscription: u64,
    not_authorized: Option<NotAuthorizedCallback>,
}

impl SyncSession {
    /// Create a session. The first poll asks for a connection.
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            state: LinkState::Disconnected,
            link: None,
            closed_by_caller: false,
            retry_at: Some(0),
            next_ping_at: None,
            topics: IndexMap::new(),
            next_subscription: 1,
            not_authorized: None,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn session_id(&self) -> &SessionId {
        &self.options.session_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected && self.link.is_some()
    }

    /// Whether `close` was called and no `reconnect` followed.
    pub fn is_closed_by_caller(&self) -> bool {
        self.closed_by_caller
    }

    /// Encode and send a message. Failures are logged and reported as false.
    pub fn send(&mut self, message: &WireMessage) -> bool {
        let Some(link) = self.link.as_mut() else {
            tracing::debug!(collection = %message.store_id, op = %message.operation, "no link, not sending");
            return false;
        };

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(collection = %message.store_id, error = %e, "failed to encode frame");
                return false;
            }
        };

        match link.send(frame) {
            Ok(()) => {
                tracing::debug!(collection = %message.store_id, op = %message.operation, "sent frame");
                true
            }
            Err(e) => {
                tracing::error!(collection = %message.store_id, error = %e, "failed to send frame");
                false
            }
        }
    }

    /// Run the keepalive and reconnect deadlines.
    pub fn poll(&mut self, now: Timestamp) -> Option<LinkRequest> {
        if self.state == LinkState::Connected {
            if let Some(at) = self.next_ping_at {
                if at <= now {
                    let ping = WireMessage::ping(self.options.session_id.clone());
                    self.send(&ping);
                    self.next_ping_at = Some(now.saturating_add(self.options.ping_interval));
                }
            }
        }

        if self.state == LinkState::Disconnected && !self.closed_by_caller {
            if let Some(at) = self.retry_at {
                if at <= now {
                    tracing::info!(session = %self.options.session_id, "connecting");
                    self.retry_at = None;
                    self.state = LinkState::Connecting;
                    return Some(LinkRequest::Connect);
                }
            }
        }

        None
    }

    /// The host opened a connection.
    pub fn opened(&mut self, link: Box<dyn Link>, now: Timestamp) {
        tracing::info!(session = %self.options.session_id, "link open");
        self.link = Some(link);
        self.state = LinkState::Connected;
        self.retry_at = None;
        self.next_ping_at = Some(now.saturating_add(self.options.ping_interval));
        self.resubscribe();
    }

    /// The connection closed or failed to open.
    pub fn closed(&mut self, now: Timestamp) {
        self.link = None;
        self.state = LinkState::Disconnected;
        self.next_ping_at = None;
        if self.closed_by_caller {
            self.retry_at = None;
        } else {
            let at = now.saturating_add(self.options.reconnect_delay);
            tracing::info!(session = %self.options.session_id, retry_at = at, "link closed, scheduling reconnect");
            self.retry_at = Some(at);
        }
    }

    /// Close for good: no reconnect until [`SyncSession::reconnect`].
    pub fn close(&mut self) {
        tracing::info!(session = %self.options.session_id, "closing link");
        self.closed_by_caller = true;
        self.link = None;
        self.state = LinkState::Disconnected;
        self.retry_at = None;
        self.next_ping_at = None;
    }

    /// Reconnect at the next poll, dropping any live link.
    pub fn reconnect(&mut self, now: Timestamp) {
        self.closed_by_caller = false;
        self.link = None;
        self.next_ping_at = None;
        self.state = LinkState::Disconnected;
        self.retry_at = Some(now);
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let retry = match self.state {
            LinkState::Disconnected if !self.closed_by_caller => self.retry_at,
            _ => None,
        };
        earliest(retry, self.next_ping_at)
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Add a topic callback. The first callback of a topic subscribes it.
    pub fn subscribe<F>(&mut self, topic: impl Into<CollectionId>, callback: F) -> SubscriptionId
    where
        F: FnMut(&WireMessage) + Send + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;

        let callbacks = self.topics.entry(topic.clone()).or_default();
        let first = callbacks.is_empty();
        callbacks.insert(id, Box::new(callback));

        if first && self.is_connected() {
            let message = WireMessage::subscribe(topic, self.options.session_id.clone());
            self.send(&message);
        }
        id
    }

    /// Remove a topic callback. The last callback of a topic unsubscribes it.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(topic) = self
            .topics
            .iter()
            .find(|(_, callbacks)| callbacks.contains_key(&id))
            .map(|(topic, _)| topic.clone())
        else {
            return false;
        };

        let now_empty = match self.topics.get_mut(&topic) {
            Some(callbacks) => {
                callbacks.shift_remove(&id);
                callbacks.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.topics.shift_remove(&topic);
            if self.is_connected() {
                let message = WireMessage::unsubscribe(topic, self.options.session_id.clone());
                self.send(&message);
            }
        }
        true
    }

    /// Topics with at least one callback.
    pub fn topics(&self) -> Vec<CollectionId> {
        self.topics.keys().cloned().collect()
    }

    fn resubscribe(&mut self) {
        let topics = self.topics();
        for topic in topics {
            let message = WireMessage::subscribe(topic, self.options.session_id.clone());
            self.send(&message);
        }
    }

    /// Deliver an event to the callbacks of its topic. Returns how many ran.
    pub fn dispatch(&mut self, message: &WireMessage) -> usize {
        let Some(callbacks) = self.topics.get_mut(&message.store_id) else {
            return 0;
        };
        for callback in callbacks.values_mut() {
            callback(message);
        }
        callbacks.len()
    }

    /// Set the callback for frames rejected as not authorized.
    pub fn on_not_authorized<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.not_authorized = Some(Box::new(callback));
    }

    pub(crate) fn notify_not_authorized(&mut self) {
        if let Some(callback) = self.not_authorized.as_mut() {
            callback();
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("closed_by_caller", &self.closed_by_caller)
            .field("retry_at", &self.retry_at)
            .field("next_ping_at", &self.next_ping_at)
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// In-memory [`Link`] that records frames.
///
/// Cloning shares the buffer, so a test keeps one handle and gives the
/// other to the session. Only built for tests and the `test-util` feature.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingLink {
    frames: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the recorded frames.
    pub fn take(&self) -> Vec<String> {
        match self.frames.lock() {
            Ok(mut frames) => std::mem::take(&mut *frames),
            Err(_) => Vec::new(),
        }
    }

    /// Take the recorded frames decoded as messages.
    pub fn take_messages(&self) -> Vec<WireMessage> {
        self.take()
            .iter()
            .filter_map(|frame| WireMessage::decode(frame).ok())
            .collect()
    }

    /// Make every following send fail.
    pub fn fail(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Link for RecordingLink {
    fn send(&mut self, frame: String) -> Result<(), LinkError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        match self.frames.lock() {
            Ok(mut frames) => {
                frames.push(frame);
                Ok(())
            }
            Err(e) => Err(LinkError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;
    use std::sync::{Arc, Mutex};

    fn session() -> SyncSession {
        SyncSession::new(SyncOptions::new("s-1").ping_interval(1_000).reconnect_delay(5_000))
    }

    fn connected(now: Timestamp) -> (SyncSession, RecordingLink) {
        let mut session = session();
        assert_eq!(session.poll(now), Some(LinkRequest::Connect));
        let link = RecordingLink::new();
        session.opened(Box::new(link.clone()), now);
        (session, link)
    }

    #[test]
    fn first_poll_requests_connect() {
        let mut session = session();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.poll(0), Some(LinkRequest::Connect));
        assert_eq!(session.state(), LinkState::Connecting);
        assert_eq!(session.poll(1), None);
    }

    #[test]
    fn close_schedules_reconnect_after_delay() {
        let (mut session, _) = connected(0);
        session.closed(100);

        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.next_deadline(), Some(5_100));
        assert_eq!(session.poll(5_099), None);
        assert_eq!(session.poll(5_100), Some(LinkRequest::Connect));
    }

    #[test]
    fn caller_close_disables_reconnect() {
        let (mut session, _) = connected(0);
        session.close();
        session.closed(10);

        assert!(session.is_closed_by_caller());
        assert_eq!(session.next_deadline(), None);
        assert_eq!(session.poll(100_000), None);

        session.reconnect(200_000);
        assert_eq!(session.poll(200_000), Some(LinkRequest::Connect));
    }

    #[test]
    fn failed_connect_retries() {
        let mut session = session();
        session.poll(0);
        session.closed(0);
        assert_eq!(session.poll(5_000), Some(LinkRequest::Connect));
    }

    #[test]
    fn keepalive_pings_while_connected() {
        let (mut session, link) = connected(0);
        assert_eq!(session.next_deadline(), Some(1_000));

        session.poll(999);
        assert!(link.take().is_empty());

        session.poll(1_000);
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, Operation::Ping);
        assert_eq!(session.next_deadline(), Some(2_000));

        session.closed(1_500);
        assert_eq!(session.next_deadline(), Some(6_500));
    }

    #[test]
    fn send_without_link_fails() {
        let mut session = session();
        assert!(!session.send(&WireMessage::fetch("users", &[], "s-1")));
    }

    #[test]
    fn send_reports_link_failure() {
        let (mut session, link) = connected(0);
        link.fail();
        assert!(!session.send(&WireMessage::fetch("users", &[], "s-1")));
    }

    #[test]
    fn subscribe_sends_once_per_topic() {
        let (mut session, link) = connected(0);

        let a = session.subscribe("chat", |_| {});
        let b = session.subscribe("chat", |_| {});
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, Operation::Subscribe);
        assert_eq!(sent[0].store_id, "chat");

        assert!(session.unsubscribe(a));
        assert!(link.take().is_empty());

        assert!(session.unsubscribe(b));
        let sent = link.take_messages();
        assert_eq!(sent[0].operation, Operation::Unsubscribe);
        assert!(session.topics().is_empty());

        assert!(!session.unsubscribe(b));
    }

    #[test]
    fn topics_are_resent_on_open() {
        let mut session = session();
        session.subscribe("chat", |_| {});
        session.subscribe("presence", |_| {});

        session.poll(0);
        let link = RecordingLink::new();
        session.opened(Box::new(link.clone()), 0);

        let topics: Vec<String> = link
            .take_messages()
            .into_iter()
            .filter(|m| m.operation == Operation::Subscribe)
            .map(|m| m.store_id)
            .collect();
        assert_eq!(topics, vec!["chat".to_string(), "presence".to_string()]);
    }

    #[test]
    fn dispatch_reaches_topic_callbacks() {
        let mut session = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        session.subscribe("chat", move |m: &WireMessage| s.lock().unwrap().push(m.cmd.clone()));
        session.subscribe("other", |_| panic!("wrong topic"));

        let event = WireMessage::command("chat", "typing", serde_json::json!({}), "s-1");
        assert_eq!(session.dispatch(&event), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Some("typing".to_string())]);
    }

    #[test]
    fn not_authorized_callback() {
        let mut session = session();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        session.on_not_authorized(move || *c.lock().unwrap() += 1);

        session.notify_not_authorized();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
