//! Model types for storing data.
//!
//! A model is one identified record of a collection: an id, four reserved
//! timestamps and an open map of domain fields. It serializes flat, so a
//! model with a `name` field looks like `{"id": "1", "name": "A"}` on the wire
//! and in persisted state.

use crate::{error::Result, Error, ModelId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the model identifier.
pub const ID_KEY: &str = "id";

/// Suffix marking timestamp fields in persisted state.
pub const TIME_SUFFIX: &str = "_at";

/// Reserved keys excluded from structural comparison.
pub const RESERVED_KEYS: [&str; 5] = ["id", "created_at", "updated_at", "changed_at", "synced_at"];

/// A data model in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Unique identifier within the collection
    pub id: ModelId,
    /// Assigned by the remote authority, immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Assigned by the remote authority on each accepted write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Local change not yet acknowledged by the remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<Timestamp>,
    /// Last time the model was confirmed consistent with the remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    /// Domain fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Model {
    /// Create a model with no domain fields.
    pub fn new(id: impl Into<ModelId>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            changed_at: None,
            synced_at: None,
            fields: Map::new(),
        }
    }

    /// Builder-style method to add a domain field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// Get a domain field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a domain field, returning the previous value.
    ///
    /// Reserved keys are not domain fields; writing one is ignored.
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(model = %self.id, key = %key, "ignoring write to reserved key");
            return None;
        }
        self.fields.insert(key, value.into())
    }

    /// Remove a domain field.
    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Whether the model carries an unacknowledged local change.
    pub fn is_dirty(&self) -> bool {
        self.changed_at.is_some_and(|t| t > 0)
    }

    /// Record a local change. A dirty model is never synced.
    pub fn mark_changed(&mut self, now: Timestamp) {
        self.changed_at = Some(now);
        self.synced_at = None;
    }

    /// Record that the remote confirmed this state.
    pub fn mark_synced(&mut self, now: Timestamp) {
        self.changed_at = None;
        self.synced_at = Some(now);
    }

    /// Copy without the local-only timestamps.
    pub fn stripped(&self) -> Self {
        Self {
            changed_at: None,
            synced_at: None,
            ..self.clone()
        }
    }

    /// Decode a model from persisted JSON.
    ///
    /// String values of keys ending in `_at` are read back as millisecond
    /// timestamps, either decimal or RFC 3339. Numeric ids are accepted and
    /// converted to strings.
    pub fn from_persisted(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::InvalidModel("expected an object".into()));
        };

        match map.get(ID_KEY) {
            Some(Value::String(_)) => {}
            Some(Value::Number(n)) => {
                let id = n.to_string();
                map.insert(ID_KEY.to_string(), Value::String(id));
            }
            _ => return Err(Error::InvalidModel("missing string id".into())),
        }

        for (key, value) in map.iter_mut() {
            if !key.ends_with(TIME_SUFFIX) {
                continue;
            }
            if let Value::String(text) = value {
                if let Some(ts) = parse_timestamp(text) {
                    *value = Value::from(ts);
                }
            }
        }

        serde_json::from_value(Value::Object(map)).map_err(|e| Error::InvalidModel(e.to_string()))
    }
}

/// Parse a persisted timestamp string.
pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<Timestamp>() {
        return Some(ms);
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .and_then(|dt| Timestamp::try_from(dt.timestamp_millis()).ok())
}
