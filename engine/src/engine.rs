//! Engine context.
//!
//! The [`Engine`] is the registry of collections for one application
//! session. It routes drained change sets to history, the sync session and
//! persistence, and applies inbound frames. It performs no IO: the host calls
//! [`Engine::poll`] at [`Engine::next_deadline`], forwards socket events to
//! `on_open`/`on_close`/`handle_frame`, and opens a connection whenever poll
//! returns [`LinkRequest::Connect`].

use crate::{
    collection::{Collection, CollectionOptions, SetReason},
    error::Result,
    notifier::SubscriptionId,
    persistence::{decode_collection, encode_collection, Persistence},
    protocol::Operation,
    schedule::earliest,
    sync::{Link, LinkRequest, LinkState, SyncOptions, SyncSession},
    CollectionId, DiffReport, Error, History, Model, ModelId, Timestamp, WireMessage,
};
use indexmap::IndexMap;
use serde_json::Value;

/// Outcome of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Collection state was updated from the frame
    Applied { changed: bool },
    /// Event handed to this many topic callbacks
    Dispatched(usize),
    /// Subscription acknowledgement
    Acknowledged,
    /// Valid frame with nothing to do
    Ignored,
    /// Frame rejected
    Dropped(DropReason),
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a valid wire message
    Malformed,
    /// Session id differs from ours
    SessionMismatch,
    /// Remote flagged the frame as not authorized
    NotAuthorized,
    /// No collection with the frame's store id
    UnknownCollection,
    /// Engine runs without a sync session
    NoSession,
}

/// Registry of collections plus history, persistence and sync.
#[derive(Debug, Default)]
pub struct Engine {
    collections: IndexMap<CollectionId, Collection>,
    history: History,
    persistence: Option<Box<dyn Persistence>>,
    sync: Option<SyncSession>,
}

impl Engine {
    /// Create a local-only engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to enable sync.
    pub fn with_sync(mut self, options: SyncOptions) -> Self {
        self.sync = Some(SyncSession::new(options));
        self
    }

    /// Builder-style method to bind a persistence bridge.
    pub fn with_persistence(mut self, persistence: impl Persistence + 'static) -> Self {
        self.persistence = Some(Box::new(persistence));
        self
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register a collection.
    ///
    /// Persisted state is loaded when the collection persists and a bridge
    /// is bound; unreadable state falls back to the seed. When a link is
    /// live the collection is attached right away.
    pub fn create_collection(&mut self, options: CollectionOptions, now: Timestamp) -> Result<()> {
        if self.collections.contains_key(&options.id) {
            return Err(Error::DuplicateCollection(options.id));
        }

        let id = options.id.clone();
        let seed = options.seed.clone();
        let mut collection = Collection::new(options);

        let restored = if collection.persists() {
            self.load(&id)
        } else {
            None
        };
        collection.load(restored.unwrap_or(seed));

        if let Some(sync) = self.sync.as_mut().filter(|s| s.is_connected()) {
            attach(sync, &mut collection, now);
        }

        tracing::debug!(collection = %id, models = collection.len(), "collection created");
        self.collections.insert(id, collection);
        Ok(())
    }

    fn load(&self, id: &str) -> Option<Vec<Model>> {
        let json = self.persistence.as_ref()?.get(id)?;
        match decode_collection(&json) {
            Ok(models) => Some(models),
            Err(e) => {
                tracing::warn!(collection = %id, error = %e, "unreadable persisted state, using seed");
                None
            }
        }
    }

    pub fn collection(&self, id: &str) -> Result<&Collection> {
        self.collections
            .get(id)
            .ok_or_else(|| Error::CollectionNotFound(id.to_string()))
    }

    pub fn collection_mut(&mut self, id: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(id)
            .ok_or_else(|| Error::CollectionNotFound(id.to_string()))
    }

    pub fn has_collection(&self, id: &str) -> bool {
        self.collections.contains_key(id)
    }

    /// Ids of all collections in creation order.
    pub fn collection_ids(&self) -> Vec<CollectionId> {
        self.collections.keys().cloned().collect()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    pub fn persistence(&self) -> Option<&dyn Persistence> {
        self.persistence.as_deref()
    }

    pub fn sync(&self) -> Option<&SyncSession> {
        self.sync.as_ref()
    }

    /// Connection state; `Disconnected` for local-only engines.
    pub fn link_state(&self) -> LinkState {
        self.sync
            .as_ref()
            .map_or(LinkState::Disconnected, SyncSession::state)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run every due timer.
    ///
    /// Drained change sets go to history, then to the link when the
    /// collection sends on flush, then to persistence.
    pub fn poll(&mut self, now: Timestamp) -> Option<LinkRequest> {
        let reports: Vec<DiffReport> = self
            .collections
            .values_mut()
            .filter_map(|collection| collection.poll(now))
            .collect();

        for report in reports {
            self.dispatch(report, now);
        }

        self.sync.as_mut().and_then(|sync| sync.poll(now))
    }

    /// Earliest time [`Engine::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let sync = self.sync.as_ref().and_then(SyncSession::next_deadline);
        self.collections
            .values()
            .map(Collection::next_deadline)
            .fold(sync, earliest)
    }

    fn dispatch(&mut self, report: DiffReport, now: Timestamp) {
        self.history.record(report.clone());

        let Some(collection) = self.collections.get_mut(&report.collection_id) else {
            return;
        };

        if collection.sync_mode().sends_on_flush() {
            match self.sync.as_mut() {
                Some(sync) if collection.is_sync_available() => {
                    let dirty = report.changed().filter(|m| m.is_dirty()).cloned().collect();
                    send_models(sync, collection, dirty, now);
                    send_deletes(sync, collection);
                }
                _ => {
                    tracing::debug!(collection = %report.collection_id, "no link, keeping changes for next attach");
                }
            }
        }

        if collection.persists() {
            if let Some(persistence) = self.persistence.as_deref_mut() {
                persist(persistence, collection);
            }
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    /// A connection opened: resubscribe topics and attach every collection.
    pub fn on_open(&mut self, link: impl Link + 'static, now: Timestamp) {
        let Some(sync) = self.sync.as_mut() else {
            tracing::warn!("link opened on an engine without sync");
            return;
        };

        sync.opened(Box::new(link), now);
        for collection in self.collections.values_mut() {
            attach(sync, collection, now);
        }
    }

    /// The connection closed; a reconnect is scheduled unless closed by us.
    pub fn on_close(&mut self, now: Timestamp) {
        if let Some(sync) = self.sync.as_mut() {
            sync.closed(now);
        }
        self.detach_all();
    }

    /// The connection failed.
    pub fn on_error(&mut self, reason: &str, now: Timestamp) {
        tracing::warn!(error = %reason, "link error");
        self.on_close(now);
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&mut self) {
        if let Some(sync) = self.sync.as_mut() {
            sync.close();
        }
        self.detach_all();
    }

    /// Drop any connection and connect again at the next poll.
    pub fn reconnect(&mut self, now: Timestamp) {
        if let Some(sync) = self.sync.as_mut() {
            sync.reconnect(now);
        }
        self.detach_all();
    }

    fn detach_all(&mut self) {
        for collection in self.collections.values_mut() {
            collection.detach();
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decode and apply one text frame.
    pub fn handle_frame(&mut self, frame: &str, now: Timestamp) -> Delivery {
        match WireMessage::decode(frame) {
            Ok(message) => self.handle_message(message, now),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                Delivery::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Apply one decoded message.
    ///
    /// A frame carrying the not-authorized error code fires the
    /// not-authorized callback whatever its session id, since the server
    /// answers a rejected frame with the sender's own session. Frames for
    /// another session without that code are dropped silently.
    ///
    /// Model operations carrying a command payload are dropped as malformed.
    pub fn handle_message(&mut self, message: WireMessage, now: Timestamp) -> Delivery {
        let Some(sync) = self.sync.as_mut() else {
            tracing::warn!(collection = %message.store_id, "frame on an engine without sync");
            return Delivery::Dropped(DropReason::NoSession);
        };

        if message.is_not_authorized() {
            tracing::warn!(collection = %message.store_id, "not authorized");
            sync.notify_not_authorized();
            return Delivery::Dropped(DropReason::NotAuthorized);
        }

        if message.session_id != *sync.session_id() {
            tracing::warn!(
                collection = %message.store_id,
                session = %message.session_id,
                "dropping frame for another session"
            );
            return Delivery::Dropped(DropReason::SessionMismatch);
        }

        if message.operation == Operation::Ping {
            return Delivery::Ignored;
        }

        if !message.is_well_formed() {
            tracing::warn!(
                collection = %message.store_id,
                op = %message.operation,
                "dropping frame without a model list"
            );
            return Delivery::Dropped(DropReason::Malformed);
        }

        let Some(collection) = self.collections.get_mut(&message.store_id) else {
            tracing::error!(
                collection = %message.store_id,
                op = %message.operation,
                "frame for unknown collection"
            );
            return Delivery::Dropped(DropReason::UnknownCollection);
        };

        let operation = message.operation;
        if operation.is_event() {
            return Delivery::Dispatched(sync.dispatch(&message));
        }

        match operation {
            Operation::Subscribed => {
                tracing::debug!(collection = %message.store_id, "subscribed");
                Delivery::Acknowledged
            }
            Operation::Response | Operation::List => {
                let changed = collection.set_collection(message.into_models(), SetReason::Sync, now);
                Delivery::Applied { changed }
            }
            Operation::Update | Operation::Set => {
                let mut changed = false;
                for model in message.into_models() {
                    changed |= collection.apply_remote(model, now);
                }
                Delivery::Applied { changed }
            }
            Operation::Delete => {
                let mut changed = false;
                for id in message.ids() {
                    changed |= collection.remove_remote(&id, now);
                }
                Delivery::Applied { changed }
            }
            _ => {
                tracing::debug!(collection = %message.store_id, op = %operation, "ignoring frame");
                Delivery::Ignored
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Request models from the remote. No ids means the whole collection.
    ///
    /// Returns false when no link is attached.
    pub fn fetch(&mut self, id: &str, ids: &[ModelId]) -> Result<bool> {
        let collection = self.collection(id)?;
        if !collection.is_sync_available() {
            tracing::debug!(collection = %id, "no link, not fetching");
            return Ok(false);
        }
        let Some(sync) = self.sync.as_mut() else {
            return Ok(false);
        };
        let message = WireMessage::fetch(id, ids, sync.session_id().clone());
        Ok(sync.send(&message))
    }

    /// Send every dirty model and pending delete of a collection now.
    ///
    /// This is how `Manual` collections sync; it works for any mode.
    pub fn push(&mut self, id: &str, now: Timestamp) -> Result<bool> {
        let collection = self
            .collections
            .get_mut(id)
            .ok_or_else(|| Error::CollectionNotFound(id.to_string()))?;
        if !collection.is_sync_available() {
            return Ok(false);
        }
        let Some(sync) = self.sync.as_mut() else {
            return Ok(false);
        };

        let dirty = collection.dirty();
        let sent = send_models(sync, collection, dirty, now);
        let deleted = send_deletes(sync, collection);
        Ok(sent && deleted)
    }

    /// Send the dirty models of a change set plus pending deletes.
    pub fn send_changes(&mut self, report: &DiffReport, now: Timestamp) -> Result<bool> {
        let collection = self
            .collections
            .get_mut(&report.collection_id)
            .ok_or_else(|| Error::CollectionNotFound(report.collection_id.clone()))?;
        if !collection.is_sync_available() {
            return Ok(false);
        }
        let Some(sync) = self.sync.as_mut() else {
            return Ok(false);
        };

        let dirty = report.changed().filter(|m| m.is_dirty()).cloned().collect();
        let sent = send_models(sync, collection, dirty, now);
        let deleted = send_deletes(sync, collection);
        Ok(sent && deleted)
    }

    /// Send a command to the subscribers of a topic.
    pub fn command(&mut self, topic: &str, cmd: &str, payload: Value) -> Result<bool> {
        let sync = self.sync.as_mut().ok_or(Error::SyncDisabled)?;
        let message = WireMessage::command(topic, cmd, payload, sync.session_id().clone());
        Ok(sync.send(&message))
    }

    /// Listen to broadcast, direct and command events of a collection.
    pub fn subscribe<F>(&mut self, topic: &str, callback: F) -> Result<SubscriptionId>
    where
        F: FnMut(&WireMessage) + Send + 'static,
    {
        if !self.collections.contains_key(topic) {
            return Err(Error::CollectionNotFound(topic.to_string()));
        }
        let sync = self.sync.as_mut().ok_or(Error::SyncDisabled)?;
        Ok(sync.subscribe(topic, callback))
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        self.sync
            .as_mut()
            .is_some_and(|sync| sync.unsubscribe(subscription))
    }

    /// Set the callback for frames rejected as not authorized.
    pub fn on_not_authorized<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let sync = self.sync.as_mut().ok_or(Error::SyncDisabled)?;
        sync.on_not_authorized(callback);
        Ok(())
    }

    /// End the session: close sync and drop collections and history.
    pub fn teardown(&mut self) {
        tracing::info!(collections = self.collections.len(), "tearing down engine");
        self.close();
        self.collections.clear();
        self.history = History::new();
    }
}

fn attach(sync: &mut SyncSession, collection: &mut Collection, now: Timestamp) {
    collection.attach();
    let mode = collection.sync_mode();

    if mode.sends_on_flush() {
        let dirty = collection.dirty();
        send_models(sync, collection, dirty, now);
        send_deletes(sync, collection);
    }

    if mode.fetches_on_attach() {
        let message = WireMessage::fetch(collection.id().clone(), &[], sync.session_id().clone());
        sync.send(&message);
    }
}

fn send_models(
    sync: &mut SyncSession,
    collection: &mut Collection,
    dirty: Vec<Model>,
    now: Timestamp,
) -> bool {
    if dirty.is_empty() {
        return true;
    }
    let message = WireMessage::set(collection.id().clone(), dirty, sync.session_id().clone());
    if !sync.send(&message) {
        return false;
    }
    collection.acknowledge(message.models(), now);
    true
}

fn send_deletes(sync: &mut SyncSession, collection: &mut Collection) -> bool {
    let ids = collection.take_pending_deletes();
    if ids.is_empty() {
        return true;
    }
    let message = WireMessage::delete(collection.id().clone(), &ids, sync.session_id().clone());
    if sync.send(&message) {
        true
    } else {
        collection.defer_deletes(ids);
        false
    }
}

fn persist(persistence: &mut dyn Persistence, collection: &Collection) {
    match encode_collection(&collection.models()) {
        Ok(json) => persistence.set(collection.id(), &json),
        Err(e) => {
            tracing::error!(collection = %collection.id(), error = %e, "failed to persist collection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collection::{SelectPolicy, SyncMode},
        persistence::MemoryPersistence,
        sync::RecordingLink,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    const FLUSH: Timestamp = 2_010;

    fn user(id: &str, name: &str) -> Model {
        Model::new(id).with_field("name", name)
    }

    fn online() -> (Engine, RecordingLink) {
        let mut engine = Engine::new().with_sync(SyncOptions::new("s-1"));
        assert_eq!(engine.poll(0), Some(LinkRequest::Connect));
        let link = RecordingLink::new();
        engine.on_open(link.clone(), 0);
        (engine, link)
    }

    fn users(mode: SyncMode) -> CollectionOptions {
        CollectionOptions::new("users").sync_mode(mode)
    }

    fn flush(engine: &mut Engine, from: Timestamp) {
        engine.poll(from + 10);
        engine.poll(from + FLUSH);
    }

    fn frame(message: &WireMessage) -> String {
        message.encode().unwrap()
    }

    #[test]
    fn duplicate_collection_fails_fast() {
        let mut engine = Engine::new();
        engine.create_collection(CollectionOptions::new("users"), 0).unwrap();

        assert_eq!(
            engine.create_collection(CollectionOptions::new("users"), 0),
            Err(Error::DuplicateCollection("users".into()))
        );
        assert!(matches!(engine.collection("posts"), Err(Error::CollectionNotFound(_))));
    }

    #[test]
    fn create_restores_persisted_state() {
        let persistence = MemoryPersistence::new()
            .with_entry("users", r#"[{"id":"1","name":"A","updated_at":"5"}]"#);
        let mut engine = Engine::new().with_persistence(persistence);
        engine
            .create_collection(CollectionOptions::new("users").persist(true), 0)
            .unwrap();

        let users = engine.collection("users").unwrap();
        assert_eq!(users.get("1").unwrap().updated_at, Some(5));
    }

    #[test]
    fn unreadable_persisted_state_falls_back_to_seed() {
        let persistence = MemoryPersistence::new().with_entry("users", "{broken");
        let mut engine = Engine::new().with_persistence(persistence);
        engine
            .create_collection(
                CollectionOptions::new("users")
                    .persist(true)
                    .seed(vec![user("seed", "S")]),
                0,
            )
            .unwrap();

        assert!(engine.collection("users").unwrap().has("seed"));
    }

    #[test]
    fn flush_feeds_history_and_persistence() {
        let mut engine = Engine::new().with_persistence(MemoryPersistence::new());
        engine
            .create_collection(CollectionOptions::new("users").persist(true), 0)
            .unwrap();

        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 0);
        flush(&mut engine, 0);

        assert_eq!(engine.history().len(), 1);
        let stored = engine.persistence().unwrap().get("users").unwrap();
        let models = decode_collection(&stored).unwrap();
        assert_eq!(models[0].field("name"), Some(&json!("A")));
    }

    #[test]
    fn attach_fetches_for_auto_collections() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        engine
            .create_collection(CollectionOptions::new("posts").sync_mode(SyncMode::SetOnly), 0)
            .unwrap();

        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, Operation::Get);
        assert_eq!(sent[0].store_id, "users");
        assert!(sent[0].models().is_empty());
    }

    #[test]
    fn flush_sends_dirty_models_and_acknowledges() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        link.take();

        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 100);
        users.set(user("2", "B"), SelectPolicy::Never, false, 100);
        flush(&mut engine, 100);

        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, Operation::Set);
        assert_eq!(sent[0].ids(), vec!["1".to_string()]);

        let model = engine.collection("users").unwrap().get("1").unwrap();
        assert!(!model.is_dirty());
        assert_eq!(model.synced_at, Some(100 + FLUSH));
    }

    #[test]
    fn flush_sends_deletes_as_ids() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::SetOnly), 0).unwrap();
        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, false, 0);
        flush(&mut engine, 0);
        link.take();

        engine.collection_mut("users").unwrap().delete("1", 5_000);
        flush(&mut engine, 5_000);

        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, Operation::Delete);
        assert_eq!(sent[0].models(), &[Model::new("1")]);
    }

    #[test]
    fn disconnected_changes_accumulate_and_replay() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        let users = engine.collection_mut("users").unwrap();
        users.set(user("gone", "G"), SelectPolicy::Never, false, 0);
        flush(&mut engine, 0);
        link.take();

        engine.on_close(3_000);
        assert!(!engine.collection("users").unwrap().is_sync_available());

        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 3_000);
        users.delete("gone", 3_000);
        flush(&mut engine, 3_000);

        assert!(link.take().is_empty());
        assert_eq!(engine.history().len(), 2);
        assert!(engine.collection("users").unwrap().get("1").unwrap().is_dirty());

        assert_eq!(engine.poll(8_000), Some(LinkRequest::Connect));
        let link = RecordingLink::new();
        engine.on_open(link.clone(), 8_000);

        let ops: Vec<Operation> = link.take_messages().iter().map(|m| m.operation).collect();
        assert_eq!(ops, vec![Operation::Set, Operation::Delete, Operation::Get]);
        assert!(!engine.collection("users").unwrap().get("1").unwrap().is_dirty());
    }

    #[test]
    fn inbound_update_inserts_missing_model() {
        let (mut engine, _) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        let response = WireMessage::response("users", vec![user("1", "A"), user("2", "B")], "s-1");
        engine.handle_frame(&frame(&response), 1);

        let update = WireMessage::update("users", vec![user("3", "C")], "s-1");
        assert_eq!(
            engine.handle_frame(&frame(&update), 2),
            Delivery::Applied { changed: true }
        );

        let users = engine.collection("users").unwrap();
        let ids: Vec<&str> = users.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(users.get("1").unwrap().field("name"), Some(&json!("A")));
    }

    #[test]
    fn inbound_response_replaces_collection() {
        let (mut engine, _) = online();
        engine
            .create_collection(users(SyncMode::Auto).auto_select(true), 0)
            .unwrap();

        let response = WireMessage::response("users", vec![user("1", "A"), user("2", "B")], "s-1");
        assert_eq!(
            engine.handle_message(response, 1),
            Delivery::Applied { changed: true }
        );

        let users = engine.collection("users").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users.selected().map(String::as_str), Some("1"));
    }

    #[test]
    fn inbound_list_is_a_full_response() {
        let (mut engine, _) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        engine
            .collection_mut("users")
            .unwrap()
            .set(user("old", "O"), SelectPolicy::Never, false, 0);

        let list = WireMessage::new("users", Operation::List, "s-1").with_models(vec![user("1", "A")]);
        engine.handle_message(list, 1);

        let users = engine.collection("users").unwrap();
        assert!(!users.has("old"));
        assert!(users.has("1"));
    }

    #[test]
    fn inbound_delete_is_not_echoed() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        let response = WireMessage::response("users", vec![user("1", "A")], "s-1");
        engine.handle_message(response, 0);
        flush(&mut engine, 0);
        link.take();

        let delete = WireMessage::delete("users", &["1".to_string()], "s-1");
        assert_eq!(
            engine.handle_message(delete, 5_000),
            Delivery::Applied { changed: true }
        );
        flush(&mut engine, 5_000);

        assert!(!engine.collection("users").unwrap().has("1"));
        assert!(link.take().is_empty());
    }

    #[test]
    fn frames_are_dropped_not_fatal() {
        let (mut engine, _) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();

        assert_eq!(
            engine.handle_frame("{not json", 0),
            Delivery::Dropped(DropReason::Malformed)
        );

        let other = WireMessage::update("users", vec![user("1", "A")], "s-2");
        assert_eq!(
            engine.handle_message(other, 0),
            Delivery::Dropped(DropReason::SessionMismatch)
        );

        let unknown = WireMessage::update("posts", vec![user("1", "A")], "s-1");
        assert_eq!(
            engine.handle_message(unknown, 0),
            Delivery::Dropped(DropReason::UnknownCollection)
        );

        assert!(engine.collection("users").unwrap().is_empty());
    }

    #[test]
    fn not_authorized_invokes_callback() {
        let (mut engine, _) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        engine.on_not_authorized(move || *c.lock().unwrap() += 1).unwrap();

        let frame = r#"{"storeId":"users","operation":"response","sessionId":"other","error_code":401}"#;
        assert_eq!(
            engine.handle_frame(frame, 0),
            Delivery::Dropped(DropReason::NotAuthorized)
        );
        assert_eq!(*count.lock().unwrap(), 1);

        // Rejections echo the sender's own session
        let own = r#"{"storeId":"users","operation":"set","sessionId":"s-1","error_code":401}"#;
        assert_eq!(
            engine.handle_frame(own, 0),
            Delivery::Dropped(DropReason::NotAuthorized)
        );
        assert_eq!(*count.lock().unwrap(), 2);

        // A plain frame for another session does not fire it
        let other = WireMessage::update("users", vec![user("1", "A")], "s-2");
        engine.handle_message(other, 0);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn events_reach_subscribers_without_mutating() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Auto), 0).unwrap();
        link.take();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        engine
            .subscribe("users", move |m: &WireMessage| {
                s.lock().unwrap().push(m.operation)
            })
            .unwrap();
        assert_eq!(link.take_messages()[0].operation, Operation::Subscribe);

        let broadcast = WireMessage::new("users", Operation::Broadcast, "s-1")
            .with_models(vec![user("9", "Z")]);
        assert_eq!(engine.handle_message(broadcast, 0), Delivery::Dispatched(1));

        assert_eq!(*seen.lock().unwrap(), vec![Operation::Broadcast]);
        assert!(engine.collection("users").unwrap().is_empty());

        let ack = WireMessage::subscribed("users", "s-1");
        assert_eq!(engine.handle_message(ack, 0), Delivery::Acknowledged);
    }

    #[test]
    fn subscribe_requires_known_collection_and_sync() {
        let (mut engine, _) = online();
        assert!(matches!(
            engine.subscribe("nope", |_| {}),
            Err(Error::CollectionNotFound(_))
        ));

        let mut offline = Engine::new();
        offline.create_collection(CollectionOptions::new("users"), 0).unwrap();
        assert_eq!(offline.subscribe("users", |_| {}), Err(Error::SyncDisabled));
    }

    #[test]
    fn manual_collections_sync_on_push() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Manual), 0).unwrap();
        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 100);
        flush(&mut engine, 100);
        assert!(link.take().is_empty());

        assert_eq!(engine.push("users", 3_000), Ok(true));
        let sent = link.take_messages();
        assert_eq!(sent[0].operation, Operation::Set);
        assert!(engine.collection("users").unwrap().dirty().is_empty());
    }

    #[test]
    fn push_without_link_is_a_noop() {
        let mut engine = Engine::new().with_sync(SyncOptions::new("s-1"));
        engine.create_collection(users(SyncMode::Manual), 0).unwrap();
        assert_eq!(engine.push("users", 0), Ok(false));
        assert_eq!(engine.fetch("users", &[]), Ok(false));
        assert!(engine.push("posts", 0).is_err());
    }

    #[test]
    fn send_changes_uses_only_dirty_models() {
        let (mut engine, link) = online();
        engine.create_collection(users(SyncMode::Off), 0).unwrap();
        let users = engine.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 50);
        users.set(user("2", "B"), SelectPolicy::Never, false, 50);
        let report = users.drain(60);

        assert_eq!(engine.send_changes(&report, 60), Ok(true));
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ids(), vec!["1".to_string()]);
    }

    #[test]
    fn round_trip_reproduces_models() {
        let (mut local, link) = online();
        local.create_collection(users(SyncMode::Auto), 0).unwrap();
        let users = local.collection_mut("users").unwrap();
        users.set(user("1", "A"), SelectPolicy::Never, true, 100);
        users.set(
            Model::new("2").with_field("tags", json!(["x", {"y": 1}])),
            SelectPolicy::Never,
            true,
            100,
        );
        flush(&mut local, 100);

        let set = link
            .take_messages()
            .into_iter()
            .find(|m| m.operation == Operation::Set)
            .unwrap();

        let (mut remote, _) = online();
        remote.create_collection(CollectionOptions::new("users"), 0).unwrap();
        remote.handle_message(WireMessage::update("users", set.into_models(), "s-1"), 5);

        let strip = |engine: &Engine| -> Vec<Model> {
            engine
                .collection("users")
                .unwrap()
                .iter()
                .map(Model::stripped)
                .collect()
        };
        assert_eq!(strip(&remote), strip(&local));
    }

    #[test]
    fn close_stops_reconnect() {
        let (mut engine, _) = online();
        engine.close();
        engine.on_close(10);
        assert_eq!(engine.link_state(), LinkState::Disconnected);
        assert_eq!(engine.poll(60_000), None);

        engine.reconnect(60_000);
        assert_eq!(engine.poll(60_000), Some(LinkRequest::Connect));
    }

    #[test]
    fn next_deadline_covers_timers_and_sync() {
        let (mut engine, _) = online();
        engine.create_collection(CollectionOptions::new("users"), 0).unwrap();
        assert_eq!(engine.next_deadline(), Some(30_000));

        engine
            .collection_mut("users")
            .unwrap()
            .set(user("1", "A"), SelectPolicy::Never, true, 100);
        assert_eq!(engine.next_deadline(), Some(110));
    }

    #[test]
    fn teardown_drops_everything() {
        let (mut engine, _) = online();
        engine.create_collection(CollectionOptions::new("users"), 0).unwrap();
        engine
            .collection_mut("users")
            .unwrap()
            .set(user("1", "A"), SelectPolicy::Never, true, 0);
        flush(&mut engine, 0);

        engine.teardown();
        assert!(engine.collection_ids().is_empty());
        assert!(engine.history().is_empty());
        assert!(engine.sync().unwrap().is_closed_by_caller());
    }
}
