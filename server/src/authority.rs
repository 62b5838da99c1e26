//! In-memory authoritative state.
//!
//! One insertion-ordered model map per collection. The authority owns the
//! server-side timestamps: `created_at` is set on the first accepted write
//! and `updated_at` on every write. Client-local stamps are not stored.

use dashmap::DashMap;
use indexmap::IndexMap;
use tessera_engine::{CollectionId, Model, ModelId, Timestamp};

/// Authoritative collections held by the server.
#[derive(Debug, Default)]
pub struct Authority {
    collections: DashMap<CollectionId, IndexMap<ModelId, Model>>,
}

impl Authority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Models of a collection. An empty id list selects all of them.
    pub fn get(&self, collection: &str, ids: &[ModelId]) -> Vec<Model> {
        let Some(models) = self.collections.get(collection) else {
            return Vec::new();
        };

        if ids.is_empty() {
            return models.values().cloned().collect();
        }

        ids.iter()
            .filter_map(|id| models.get(id))
            .cloned()
            .collect()
    }

    /// Accept a batch of writes and return the stored versions.
    ///
    /// `updated_at` never goes backwards relative to the writer's own
    /// `changed_at`, so a clean replica always orders an accepted write after
    /// the edit that produced it.
    pub fn set(&self, collection: &str, models: Vec<Model>, now: Timestamp) -> Vec<Model> {
        let mut stored = self.collections.entry(collection.to_string()).or_default();

        models
            .into_iter()
            .map(|incoming| {
                let written_at = incoming.changed_at.unwrap_or(0).max(now);
                let mut model = incoming.stripped();
                model.created_at = stored
                    .get(&model.id)
                    .and_then(|existing| existing.created_at)
                    .or(Some(now));
                model.updated_at = Some(written_at);

                stored.insert(model.id.clone(), model.clone());
                model
            })
            .collect()
    }

    /// Remove models and return the ids that existed.
    pub fn delete(&self, collection: &str, ids: &[ModelId]) -> Vec<ModelId> {
        let Some(mut models) = self.collections.get_mut(collection) else {
            return Vec::new();
        };

        ids.iter()
            .filter(|id| models.shift_remove(id.as_str()).is_some())
            .cloned()
            .collect()
    }

    /// Number of models in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|models| models.len())
            .unwrap_or(0)
    }

    /// Number of collections that have seen a write.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }
}
