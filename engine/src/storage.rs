//! Storage - the per-collection model container and diff accumulator.
//!
//! Storage holds the live `id -> Model` map of one collection and tracks what
//! changed since the last drain in four accumulators: inserted, updated,
//! deleted and previous (pre-change snapshots). An id is in at most one of
//! inserted/updated/deleted per window:
//!
//! | sequence within a window | reported as |
//! |--------------------------|-------------|
//! | insert, update           | inserted    |
//! | insert, delete           | nothing     |
//! | update, delete           | deleted     |
//! | delete, insert           | updated (or nothing if restored unchanged) |
//!
//! `previous` always holds the state from before the window opened.

use crate::{diff::is_different, CollectionId, Model, ModelId, Timestamp};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Time span a diff report accumulated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    /// First mutation of the window
    pub opened_at: Timestamp,
    /// When the accumulators were drained
    pub drained_at: Timestamp,
}

/// The delta of one collection between two drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    /// Collection the changes belong to
    pub collection_id: CollectionId,
    /// Models created in the window, in their current state
    pub inserted: Vec<Model>,
    /// Models changed in the window, in their current state
    pub updated: Vec<Model>,
    /// Models removed in the window, as they were when removed
    pub deleted: Vec<Model>,
    /// Pre-window state of every updated or deleted model
    pub previous: Vec<Model>,
    /// Accumulation window
    pub window: Window,
}

impl DiffReport {
    /// Create an empty report.
    pub fn empty(collection_id: impl Into<CollectionId>) -> Self {
        Self {
            collection_id: collection_id.into(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            previous: Vec::new(),
            window: Window::default(),
        }
    }

    /// Whether the report carries no change.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed ids.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Inserted and updated models.
    pub fn changed(&self) -> impl Iterator<Item = &Model> {
        self.inserted.iter().chain(self.updated.iter())
    }

    /// Ids of the deleted models.
    pub fn deleted_ids(&self) -> Vec<ModelId> {
        self.deleted.iter().map(|m| m.id.clone()).collect()
    }

    /// Pre-window snapshot of a model.
    pub fn previous_of(&self, id: &str) -> Option<&Model> {
        self.previous.iter().find(|m| m.id == id)
    }
}

/// Live models of one collection plus the diff accumulators.
#[derive(Debug, Clone)]
pub struct Storage {
    collection_id: CollectionId,
    models: IndexMap<ModelId, Model>,
    inserted: IndexSet<ModelId>,
    updated: IndexSet<ModelId>,
    deleted: IndexMap<ModelId, Model>,
    previous: IndexMap<ModelId, Model>,
}

impl Storage {
    /// Create empty storage for a collection.
    pub fn new(collection_id: impl Into<CollectionId>) -> Self {
        Self {
            collection_id: collection_id.into(),
            models: IndexMap::new(),
            inserted: IndexSet::new(),
            updated: IndexSet::new(),
            deleted: IndexMap::new(),
            previous: IndexMap::new(),
        }
    }

    /// Collection this storage belongs to.
    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    /// Get a model by id.
    pub fn get(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    /// Check if a model exists.
    pub fn has(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// Number of live models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Check if the collection has no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// First model in insertion order.
    pub fn first(&self) -> Option<&Model> {
        self.models.values().next()
    }

    /// Live models in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// Copy of the live models in insertion order.
    pub fn models(&self) -> Vec<Model> {
        self.models.values().cloned().collect()
    }

    /// Models carrying an unacknowledged local change.
    pub fn dirty(&self) -> impl Iterator<Item = &Model> {
        self.models.values().filter(|m| m.is_dirty())
    }

    /// Whether anything accumulated since the last drain.
    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    /// Insert or replace a model.
    ///
    /// Returns false without recording anything when the stored model is
    /// structurally identical.
    pub fn set(&mut self, model: Model) -> bool {
        let id = model.id.clone();

        match self.models.get(&id) {
            Some(existing) => {
                if !is_different(existing, &model) {
                    return false;
                }
                if !self.inserted.contains(&id) {
                    if !self.previous.contains_key(&id) {
                        self.previous.insert(id.clone(), existing.clone());
                    }
                    self.updated.insert(id.clone());
                }
            }
            None => {
                if self.deleted.shift_remove(&id).is_some() {
                    let restored = self
                        .previous
                        .get(&id)
                        .is_some_and(|before| !is_different(before, &model));
                    if restored {
                        self.previous.shift_remove(&id);
                    } else {
                        self.updated.insert(id.clone());
                    }
                } else {
                    self.inserted.insert(id.clone());
                }
            }
        }

        self.models.insert(id, model);
        true
    }

    /// Remove a model. Returns false if it was absent.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(model) = self.models.shift_remove(id) else {
            return false;
        };

        if self.inserted.shift_remove(id) {
            return true;
        }

        self.updated.shift_remove(id);
        if !self.previous.contains_key(id) {
            self.previous.insert(id.to_string(), model.clone());
        }
        self.deleted.insert(id.to_string(), model);
        true
    }

    /// Replace the whole collection.
    ///
    /// Ids only in the old set are deleted, ids only in the new set are
    /// inserted and shared ids are compared structurally. With
    /// `preserve_unsynced_local`, dirty local models survive even when the
    /// new set omits them. Returns false when nothing changed.
    pub fn replace_all(&mut self, models: Vec<Model>, preserve_unsynced_local: bool) -> bool {
        let incoming: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();

        let removed: Vec<ModelId> = self
            .models
            .values()
            .filter(|m| !incoming.contains(m.id.as_str()))
            .filter(|m| !(preserve_unsynced_local && m.is_dirty()))
            .map(|m| m.id.clone())
            .collect();

        let mut changed = false;
        for id in &removed {
            changed |= self.delete(id);
        }
        for model in models {
            changed |= self.set(model);
        }
        changed
    }

    /// Rewrite the reserved timestamps of a live model.
    ///
    /// Accumulators are untouched; timestamps are not domain state.
    pub fn stamp<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Model),
    {
        match self.models.get_mut(id) {
            Some(model) => {
                f(model);
                true
            }
            None => false,
        }
    }

    /// Copy and clear all accumulators.
    ///
    /// Draining is destructive: a second drain without intervening mutation
    /// returns an empty report.
    pub fn drain_diff(&mut self, window: Window) -> DiffReport {
        let inserted = std::mem::take(&mut self.inserted)
            .into_iter()
            .filter_map(|id| self.models.get(&id).cloned())
            .collect();
        let updated = std::mem::take(&mut self.updated)
            .into_iter()
            .filter_map(|id| self.models.get(&id).cloned())
            .collect();
        let deleted = std::mem::take(&mut self.deleted).into_values().collect();
        let previous = std::mem::take(&mut self.previous).into_values().collect();

        DiffReport {
            collection_id: self.collection_id.clone(),
            inserted,
            updated,
            deleted,
            previous,
            window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user(id: &str, name: &str) -> Model {
        Model::new(id).with_field("name", name)
    }

    fn ids(models: &[Model]) -> Vec<&str> {
        models.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn set_inserts_new_model() {
        let mut storage = Storage::new("users");
        assert!(storage.set(user("1", "A")));

        assert!(storage.has("1"));
        assert_eq!(storage.len(), 1);

        let report = storage.drain_diff(Window::default());
        assert_eq!(ids(&report.inserted), vec!["1"]);
        assert!(report.updated.is_empty());
        assert!(report.previous.is_empty());
    }

    #[test]
    fn identical_set_is_noop() {
        let mut storage = Storage::new("users");
        assert!(storage.set(user("1", "A")));
        storage.drain_diff(Window::default());

        assert!(!storage.set(user("1", "A")));
        assert!(!storage.has_changes());
        assert!(storage.drain_diff(Window::default()).is_empty());
    }

    #[test]
    fn update_snapshots_previous() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.drain_diff(Window::default());

        assert!(storage.set(user("1", "B")));
        assert!(storage.set(user("1", "C")));

        let report = storage.drain_diff(Window::default());
        assert_eq!(report.updated, vec![user("1", "C")]);
        assert_eq!(report.previous, vec![user("1", "A")]);
    }

    #[test]
    fn insert_then_update_stays_inserted() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.set(user("1", "B"));

        let report = storage.drain_diff(Window::default());
        assert_eq!(report.inserted, vec![user("1", "B")]);
        assert!(report.updated.is_empty());
        assert!(report.previous.is_empty());
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        assert!(storage.delete("1"));

        assert!(storage.drain_diff(Window::default()).is_empty());
    }

    #[test]
    fn update_then_delete_reports_deleted() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.drain_diff(Window::default());

        storage.set(user("1", "B"));
        storage.delete("1");

        let report = storage.drain_diff(Window::default());
        assert!(report.updated.is_empty());
        assert_eq!(report.deleted, vec![user("1", "B")]);
        assert_eq!(report.previous, vec![user("1", "A")]);
    }

    #[test]
    fn delete_then_reinsert_reports_updated() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.drain_diff(Window::default());

        storage.delete("1");
        storage.set(user("1", "Z"));

        let report = storage.drain_diff(Window::default());
        assert!(report.deleted.is_empty());
        assert_eq!(report.updated, vec![user("1", "Z")]);
        assert_eq!(report.previous, vec![user("1", "A")]);
    }

    #[test]
    fn delete_then_restore_reports_nothing() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.drain_diff(Window::default());

        storage.delete("1");
        storage.set(user("1", "A"));

        assert!(storage.drain_diff(Window::default()).is_empty());
    }

    #[test]
    fn delete_absent_is_noop() {
        let mut storage = Storage::new("users");
        assert!(!storage.delete("missing"));
        assert!(!storage.has_changes());
    }

    #[test]
    fn drain_is_destructive() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));

        assert!(!storage.drain_diff(Window::default()).is_empty());
        assert!(storage.drain_diff(Window::default()).is_empty());
    }

    #[test]
    fn drain_carries_collection_and_window() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));

        let window = Window {
            opened_at: 10,
            drained_at: 20,
        };
        let report = storage.drain_diff(window);
        assert_eq!(report.collection_id, "users");
        assert_eq!(report.window, window);
    }

    #[test]
    fn replace_all_classifies_ids() {
        let mut storage = Storage::new("users");
        storage.replace_all(vec![user("1", "A"), user("2", "B"), user("3", "C")], false);
        storage.drain_diff(Window::default());

        let changed = storage.replace_all(vec![user("2", "B"), user("3", "X"), user("4", "D")], false);
        assert!(changed);

        let report = storage.drain_diff(Window::default());
        assert_eq!(ids(&report.inserted), vec!["4"]);
        assert_eq!(ids(&report.updated), vec!["3"]);
        assert_eq!(ids(&report.deleted), vec!["1"]);
        assert_eq!(ids(&report.previous), vec!["1", "3"]);
    }

    #[test]
    fn replace_all_without_delta_returns_false() {
        let mut storage = Storage::new("users");
        storage.replace_all(vec![user("1", "A")], false);
        storage.drain_diff(Window::default());

        assert!(!storage.replace_all(vec![user("1", "A")], false));
        assert!(!storage.has_changes());
    }

    #[test]
    fn replace_all_preserves_dirty_local() {
        let mut storage = Storage::new("users");
        let mut pending = user("1", "A");
        pending.mark_changed(100);
        storage.set(pending);
        storage.set(user("2", "B"));
        storage.drain_diff(Window::default());

        storage.replace_all(vec![user("3", "C")], true);

        assert!(storage.has("1"));
        assert!(!storage.has("2"));
        assert!(storage.has("3"));
    }

    #[test]
    fn replace_all_without_preserve_drops_dirty_local() {
        let mut storage = Storage::new("users");
        let mut pending = user("1", "A");
        pending.mark_changed(100);
        storage.set(pending);

        storage.replace_all(vec![], false);
        assert!(storage.is_empty());
    }

    #[test]
    fn stamp_does_not_record_changes() {
        let mut storage = Storage::new("users");
        storage.set(user("1", "A"));
        storage.drain_diff(Window::default());

        assert!(storage.stamp("1", |m| m.mark_synced(50)));
        assert_eq!(storage.get("1").unwrap().synced_at, Some(50));
        assert!(!storage.has_changes());
        assert!(!storage.stamp("missing", |m| m.mark_synced(50)));
    }

    #[test]
    fn first_follows_insertion_order() {
        let mut storage = Storage::new("users");
        storage.set(user("b", "B"));
        storage.set(user("a", "A"));

        assert_eq!(storage.first().unwrap().id, "b");
        storage.delete("b");
        assert_eq!(storage.first().unwrap().id, "a");
    }

    #[test]
    fn dirty_lists_pending_models() {
        let mut storage = Storage::new("users");
        let mut pending = user("1", "A");
        pending.mark_changed(1);
        storage.set(pending);
        storage.set(user("2", "B"));

        let dirty: Vec<_> = storage.dirty().map(|m| m.id.as_str()).collect();
        assert_eq!(dirty, vec!["1"]);
    }

    #[test]
    fn stored_models_are_independent_copies() {
        let mut storage = Storage::new("users");
        let mut model = user("1", "A");
        storage.set(model.clone());
        model.set_field("name", json!("mutated"));

        assert_eq!(storage.get("1").unwrap().field("name"), Some(&json!("A")));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        fn arb_collection() -> impl Strategy<Value = Vec<(u8, u8)>> {
            prop::collection::btree_map(0u8..12, 0u8..3, 0..10)
                .prop_map(|m| m.into_iter().collect())
        }

        fn build(entries: &[(u8, u8)]) -> Vec<Model> {
            entries
                .iter()
                .map(|(id, v)| Model::new(id.to_string()).with_field("v", *v))
                .collect()
        }

        proptest! {
            #[test]
            fn prop_replace_all_classification(old in arb_collection(), new in arb_collection()) {
                let mut storage = Storage::new("items");
                storage.replace_all(build(&old), false);
                storage.drain_diff(Window::default());

                storage.replace_all(build(&new), false);
                let report = storage.drain_diff(Window::default());

                let old_ids: BTreeSet<u8> = old.iter().map(|(id, _)| *id).collect();
                let new_ids: BTreeSet<u8> = new.iter().map(|(id, _)| *id).collect();
                let as_set = |models: &[Model]| -> BTreeSet<u8> {
                    models.iter().map(|m| m.id.parse().unwrap()).collect()
                };

                let expected_inserted: BTreeSet<u8> = new_ids.difference(&old_ids).copied().collect();
                let expected_deleted: BTreeSet<u8> = old_ids.difference(&new_ids).copied().collect();
                let expected_updated: BTreeSet<u8> = old
                    .iter()
                    .filter(|(id, v)| new.iter().any(|(nid, nv)| nid == id && nv != v))
                    .map(|(id, _)| *id)
                    .collect();

                prop_assert_eq!(as_set(&report.inserted), expected_inserted);
                prop_assert_eq!(as_set(&report.deleted), expected_deleted);
                prop_assert_eq!(as_set(&report.updated), expected_updated);
                prop_assert_eq!(storage.len(), new_ids.len());
            }
        }
    }
}
