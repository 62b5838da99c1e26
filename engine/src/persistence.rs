//! Persistence bridge.
//!
//! The engine stores each collection as one JSON array under the collection
//! id. Durable storage is the host's business; it plugs in through
//! [`Persistence`].

use crate::{error::Result, Error, Model};
use serde_json::Value;
use std::collections::HashMap;

/// String key-value store the engine persists collections into.
pub trait Persistence: Send {
    /// Read the stored JSON for a key.
    fn get(&self, key: &str) -> Option<String>;

    /// Store JSON under a key.
    fn set(&mut self, key: &str, json: &str);
}

impl std::fmt::Debug for dyn Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Persistence")
    }
}

/// In-process persistence, for tests and hosts without durable storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    entries: HashMap<String, String>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with one entry.
    pub fn with_entry(mut self, key: impl Into<String>, json: impl Into<String>) -> Self {
        self.entries.insert(key.into(), json.into());
        self
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, json: &str) {
        self.entries.insert(key.to_string(), json.to_string());
    }
}

/// Serialize a collection for persistence.
pub fn encode_collection(models: &[Model]) -> Result<String> {
    serde_json::to_string(models).map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse a persisted collection.
///
/// Timestamp fields stored as strings are read back as numbers.
pub fn decode_collection(json: &str) -> Result<Vec<Model>> {
    let value: Value = serde_json::from_str(json)?;
    let Value::Array(items) = value else {
        return Err(Error::Serialization("expected an array of models".into()));
    };
    items.into_iter().map(Model::from_persisted).collect()
}
