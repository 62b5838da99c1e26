//! Collection controller.
//!
//! A [`Collection`] wraps [`Storage`] with selection, sync policy and the two
//! debounce stages. Every mutation goes through here; storage is never
//! touched directly by callers.

use crate::{
    diff::is_different,
    merge::{resolve, Resolution},
    notifier::SubscriptionId,
    schedule::{DispatchTimers, Timings},
    storage::Window,
    CollectionId, DiffReport, Model, ModelId, Notifier, Storage, Timestamp,
};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// How a collection takes part in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Local only
    #[default]
    Off,
    /// Fetch on attach, send changes on every flush
    Auto,
    /// Send changes, never fetch
    SetOnly,
    /// Fetch on attach, never send
    FetchOnly,
    /// Send only on explicit push
    Manual,
}

impl SyncMode {
    /// Whether attaching to a link issues a fetch of the whole collection.
    pub fn fetches_on_attach(self) -> bool {
        matches!(self, SyncMode::Auto | SyncMode::FetchOnly)
    }

    /// Whether local changes are sent at each flush.
    pub fn sends_on_flush(self) -> bool {
        matches!(self, SyncMode::Auto | SyncMode::SetOnly)
    }

    /// Whether local changes are ever sent.
    pub fn sends_changes(self) -> bool {
        matches!(self, SyncMode::Auto | SyncMode::SetOnly | SyncMode::Manual)
    }
}

/// Selection behavior of [`Collection::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectPolicy {
    /// Leave the selection alone
    #[default]
    Never,
    /// Select the model if the collection was empty before the write
    IfEmpty,
    /// Always select the model
    Always,
}

/// Origin of a full collection replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetReason {
    /// Written by the application; changed models are marked dirty
    Local,
    /// Received from the remote; never marks, keeps unsynced local edits
    Sync,
}

/// Construction options of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOptions {
    /// Collection id, unique in the engine
    pub id: CollectionId,
    /// Select the first model whenever nothing is selected
    #[serde(default)]
    pub auto_select: bool,
    /// Sync participation
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Initial data, restored by [`Collection::clear`]
    #[serde(default)]
    pub seed: Vec<Model>,
    /// Persist the collection through the engine's persistence bridge
    #[serde(default)]
    pub persist: bool,
    /// Debounce windows
    #[serde(default)]
    pub timings: Timings,
}

impl CollectionOptions {
    /// Options with defaults for the given id.
    pub fn new(id: impl Into<CollectionId>) -> Self {
        Self {
            id: id.into(),
            auto_select: false,
            sync_mode: SyncMode::Off,
            seed: Vec::new(),
            persist: false,
            timings: Timings::default(),
        }
    }

    pub fn auto_select(mut self, enabled: bool) -> Self {
        self.auto_select = enabled;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn seed(mut self, models: Vec<Model>) -> Self {
        self.seed = models;
        self
    }

    pub fn persist(mut self, enabled: bool) -> Self {
        self.persist = enabled;
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }
}

/// One collection: storage plus selection and sync policy.
#[derive(Debug)]
pub struct Collection {
    storage: Storage,
    selected: Option<ModelId>,
    auto_select: bool,
    sync_mode: SyncMode,
    seed: Vec<Model>,
    persist: bool,
    timers: DispatchTimers,
    window_opened_at: Option<Timestamp>,
    attached: bool,
    pending_deletes: IndexSet<ModelId>,
    changes: Notifier<[Model]>,
    selection: Notifier<Option<ModelId>>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(options: CollectionOptions) -> Self {
        Self {
            storage: Storage::new(options.id),
            selected: None,
            auto_select: options.auto_select,
            sync_mode: options.sync_mode,
            seed: options.seed,
            persist: options.persist,
            timers: DispatchTimers::new(options.timings),
            window_opened_at: None,
            attached: false,
            pending_deletes: IndexSet::new(),
            changes: Notifier::new(),
            selection: Notifier::new(),
        }
    }

    /// Install the initial state without producing a change set.
    pub(crate) fn load(&mut self, models: Vec<Model>) {
        self.storage.replace_all(models, false);
        self.storage.drain_diff(Window::default());
        self.fix_selection();
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    pub fn id(&self) -> &CollectionId {
        self.storage.collection_id()
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.storage.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.storage.has(id)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Copy of all models in insertion order.
    pub fn models(&self) -> Vec<Model> {
        self.storage.models()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.storage.iter()
    }

    /// Copy of the models with unacknowledged local changes.
    pub fn dirty(&self) -> Vec<Model> {
        self.storage.dirty().cloned().collect()
    }

    /// Id of the selected model.
    pub fn selected(&self) -> Option<&ModelId> {
        self.selected.as_ref()
    }

    /// The selected model.
    pub fn selected_model(&self) -> Option<&Model> {
        self.selected.as_deref().and_then(|id| self.storage.get(id))
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
        if !mode.sends_changes() {
            self.pending_deletes.clear();
        }
    }

    pub fn auto_select(&self) -> bool {
        self.auto_select
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    /// Whether a live link is attached.
    pub fn is_sync_available(&self) -> bool {
        self.attached
    }

    /// Ids deleted locally and not yet sent.
    pub fn pending_deletes(&self) -> Vec<ModelId> {
        self.pending_deletes.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Listen to coalesced changes; receives the full model list.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&[Model]) + Send + 'static,
    {
        self.changes.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    /// Listen to selection changes.
    pub fn on_select<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&Option<ModelId>) + Send + 'static,
    {
        self.selection.subscribe(listener)
    }

    pub fn off_select(&mut self, id: SubscriptionId) -> bool {
        self.selection.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Replace the whole collection.
    pub fn set_collection(&mut self, models: Vec<Model>, reason: SetReason, now: Timestamp) -> bool {
        let changed = match reason {
            SetReason::Local => self.replace_local(models, now),
            SetReason::Sync => self.replace_synced(models, now),
        };
        if changed {
            self.touched(now);
        }
        self.fix_selection();
        changed
    }

    fn replace_local(&mut self, models: Vec<Model>, now: Timestamp) -> bool {
        let incoming: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
        let removed: Vec<ModelId> = self
            .storage
            .iter()
            .filter(|m| !incoming.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();

        let models: Vec<Model> = models
            .into_iter()
            .map(|mut model| {
                let differs = self
                    .storage
                    .get(&model.id)
                    .map_or(true, |existing| is_different(existing, &model));
                if differs {
                    model.mark_changed(now);
                }
                model
            })
            .collect();

        for model in &models {
            self.pending_deletes.shift_remove(&model.id);
        }
        if self.sync_mode.sends_changes() {
            self.pending_deletes.extend(removed);
        }

        self.storage.replace_all(models, false)
    }

    fn replace_synced(&mut self, models: Vec<Model>, now: Timestamp) -> bool {
        let mut accepted = Vec::new();
        let models: Vec<Model> = models
            .into_iter()
            .map(|mut incoming| {
                let local = self.storage.get(&incoming.id);
                match resolve(local, &incoming) {
                    Resolution::AcceptRemote => {
                        incoming.mark_synced(now);
                        accepted.push((
                            incoming.id.clone(),
                            incoming.created_at,
                            incoming.updated_at,
                        ));
                        incoming
                    }
                    Resolution::KeepLocal => {
                        tracing::debug!(
                            collection = %self.storage.collection_id(),
                            model = %incoming.id,
                            "keeping newer local model"
                        );
                        local.cloned().unwrap_or(incoming)
                    }
                }
            })
            .collect();

        let changed = self.storage.replace_all(models, true);
        for (id, created_at, updated_at) in accepted {
            self.stamp_remote(&id, created_at, updated_at, now);
        }
        changed
    }

    /// Insert or replace one model.
    ///
    /// `mark_changed` stamps `changed_at`; it is true for application writes
    /// and false for writes arriving from sync.
    pub fn set(
        &mut self,
        mut model: Model,
        select: SelectPolicy,
        mark_changed: bool,
        now: Timestamp,
    ) -> bool {
        let was_empty = self.storage.is_empty();
        let id = model.id.clone();

        if mark_changed {
            model.mark_changed(now);
            self.pending_deletes.shift_remove(&id);
        }

        let changed = self.storage.set(model);
        if changed {
            self.touched(now);
        }

        match select {
            SelectPolicy::Always => {
                self.select(Some(&id));
            }
            SelectPolicy::IfEmpty if was_empty => {
                self.select(Some(&id));
            }
            _ => {}
        }

        changed
    }

    /// Read-modify-write of one field. Returns false if the model is absent.
    pub fn set_field(
        &mut self,
        id: &str,
        key: &str,
        value: impl Into<Value>,
        mark_changed: bool,
        now: Timestamp,
    ) -> bool {
        let Some(mut model) = self.storage.get(id).cloned() else {
            tracing::warn!(collection = %self.id(), model = %id, "set_field on missing model");
            return false;
        };
        model.set_field(key, value);
        self.set(model, SelectPolicy::Never, mark_changed, now)
    }

    /// Remove a model. Clears the selection if it pointed at the model.
    pub fn delete(&mut self, id: &str, now: Timestamp) -> bool {
        if !self.remove(id, now) {
            return false;
        }
        if self.sync_mode.sends_changes() {
            self.pending_deletes.insert(id.to_string());
        }
        true
    }

    fn remove(&mut self, id: &str, now: Timestamp) -> bool {
        if !self.storage.delete(id) {
            return false;
        }
        self.touched(now);
        if self.selected.as_deref() == Some(id) {
            self.set_selected(None);
        }
        true
    }

    /// Change the selection. Unknown ids unset it.
    pub fn select(&mut self, id: Option<&str>) -> bool {
        let next = id.filter(|id| self.storage.has(id)).map(str::to_string);
        if next == self.selected {
            return false;
        }
        self.set_selected(next);
        true
    }

    /// Restore the seed data (or empty).
    pub fn clear(&mut self, now: Timestamp) -> bool {
        let seed = self.seed.clone();
        self.set_collection(seed, SetReason::Local, now)
    }

    /// Apply one model received from the remote (partial update path).
    pub fn apply_remote(&mut self, mut model: Model, now: Timestamp) -> bool {
        if resolve(self.storage.get(&model.id), &model) == Resolution::KeepLocal {
            tracing::debug!(collection = %self.id(), model = %model.id, "keeping newer local model");
            return false;
        }

        let id = model.id.clone();
        let (created_at, updated_at) = (model.created_at, model.updated_at);
        model.mark_synced(now);

        let changed = self.storage.set(model);
        if changed {
            self.touched(now);
        } else {
            self.stamp_remote(&id, created_at, updated_at, now);
        }
        changed
    }

    /// Remove a model the remote deleted. Never echoed back.
    pub fn remove_remote(&mut self, id: &str, now: Timestamp) -> bool {
        self.pending_deletes.shift_remove(id);
        self.remove(id, now)
    }

    /// Mark sent models as acknowledged.
    ///
    /// Only models still carrying the sent `changed_at` are cleared, so a
    /// newer local edit stays dirty.
    pub fn acknowledge(&mut self, sent: &[Model], now: Timestamp) {
        for model in sent {
            self.storage.stamp(&model.id, |live| {
                if live.changed_at == model.changed_at {
                    live.mark_synced(now);
                }
            });
        }
    }

    fn stamp_remote(
        &mut self,
        id: &str,
        created_at: Option<Timestamp>,
        updated_at: Option<Timestamp>,
        now: Timestamp,
    ) {
        self.storage.stamp(id, |live| {
            live.created_at = live.created_at.or(created_at);
            live.updated_at = updated_at.or(live.updated_at);
            live.mark_synced(now);
        });
    }

    // ------------------------------------------------------------------
    // Sync plumbing
    // ------------------------------------------------------------------

    pub(crate) fn attach(&mut self) {
        self.attached = true;
    }

    pub(crate) fn detach(&mut self) {
        self.attached = false;
    }

    pub(crate) fn take_pending_deletes(&mut self) -> Vec<ModelId> {
        std::mem::take(&mut self.pending_deletes)
            .into_iter()
            .filter(|id| !self.storage.has(id))
            .collect()
    }

    pub(crate) fn defer_deletes(&mut self, ids: Vec<ModelId>) {
        self.pending_deletes.extend(ids);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn touched(&mut self, now: Timestamp) {
        self.window_opened_at.get_or_insert(now);
        self.timers.notify.schedule(now);
    }

    /// Run the debounce stages.
    ///
    /// The notify stage broadcasts the current models and arms the flush
    /// stage; the flush stage drains the accumulated diff.
    pub fn poll(&mut self, now: Timestamp) -> Option<DiffReport> {
        if self.timers.notify.fire(now) {
            let models = self.storage.models();
            self.changes.notify(&models);
            self.timers.flush.schedule(now);
        }

        if self.timers.flush.fire(now) {
            if self.storage.has_changes() {
                return Some(self.drain(now));
            }
            // Changes cancelled out; the next window starts fresh
            self.window_opened_at = None;
        }
        None
    }

    /// Drain the accumulated diff immediately.
    pub fn drain(&mut self, now: Timestamp) -> DiffReport {
        let window = Window {
            opened_at: self.window_opened_at.take().unwrap_or(now),
            drained_at: now,
        };
        self.storage.drain_diff(window)
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    fn fix_selection(&mut self) {
        if let Some(selected) = &self.selected {
            if !self.storage.has(selected) {
                self.set_selected(None);
            }
        }
        if self.selected.is_none() && self.auto_select {
            if let Some(first) = self.storage.first() {
                let id = first.id.clone();
                self.set_selected(Some(id));
            }
        }
    }

    fn set_selected(&mut self, id: Option<ModelId>) {
        self.selected = id;
        self.selection.notify(&self.selected);
    }
}
