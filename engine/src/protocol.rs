//! Wire message protocol.
//!
//! One JSON object per frame:
//!
//! ```text
//! { "storeId": "users", "operation": "set", "payload": [ {...} ],
//!   "cmd": "optional", "sessionId": "s-1", "error_code": 401 }
//! ```
//!
//! `payload` is either a list of models or an opaque command object.

use crate::{error::Result, CollectionId, Error, Model, ModelId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code carried by frames rejected for authorization.
pub const NOT_AUTHORIZED: u16 = 401;

/// Operation tag of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Fetch request; an empty payload means "all"
    Get,
    /// Upsert of dirty models
    Set,
    /// Removal; payload carries ids only
    Delete,
    /// Opaque command for the topic
    Cmd,
    /// Full collection state
    Response,
    /// Full collection state (listing form)
    List,
    /// Partial update of some models
    Update,
    /// Topic subscription request
    Subscribe,
    /// Topic subscription removal
    Unsubscribe,
    /// Subscription acknowledgement
    Subscribed,
    /// Event relayed to every subscriber of a topic
    Broadcast,
    /// Event addressed to this connection
    Direct,
    /// Keepalive
    Ping,
}

impl Operation {
    /// Pub/sub events are delivered to topic callbacks and never mutate
    /// collection state.
    pub fn is_event(self) -> bool {
        matches!(self, Operation::Broadcast | Operation::Direct | Operation::Cmd)
    }

    /// Full collection replacements.
    pub fn is_full_response(self) -> bool {
        matches!(self, Operation::Response | Operation::List)
    }

    /// Operations whose payload must be a model list.
    pub fn carries_models(self) -> bool {
        matches!(
            self,
            Operation::Get
                | Operation::Set
                | Operation::Delete
                | Operation::Response
                | Operation::List
                | Operation::Update
        )
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Cmd => "cmd",
            Operation::Response => "response",
            Operation::List => "list",
            Operation::Update => "update",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::Subscribed => "subscribed",
            Operation::Broadcast => "broadcast",
            Operation::Direct => "direct",
            Operation::Ping => "ping",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// List of models (or id-only models for fetch and delete)
    Models(Vec<Model>),
    /// Opaque command payload
    Command(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Models(Vec::new())
    }
}

/// One frame of the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Collection (topic) the frame belongs to
    pub store_id: CollectionId,
    /// Operation tag
    pub operation: Operation,
    /// Models or command payload
    #[serde(default)]
    pub payload: Payload,
    /// Command name for `cmd` frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Session the frame is scoped to
    #[serde(default)]
    pub session_id: SessionId,
    /// Error marker set by the remote
    #[serde(
        rename = "error_code",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_code: Option<u16>,
}

impl WireMessage {
    /// Create a message with an empty model payload.
    pub fn new(
        store_id: impl Into<CollectionId>,
        operation: Operation,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            operation,
            payload: Payload::default(),
            cmd: None,
            session_id: session_id.into(),
            error_code: None,
        }
    }

    /// Builder-style method to attach models.
    pub fn with_models(mut self, models: Vec<Model>) -> Self {
        self.payload = Payload::Models(models);
        self
    }

    /// Fetch request. No ids means the whole collection.
    pub fn fetch(
        store_id: impl Into<CollectionId>,
        ids: &[ModelId],
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::new(store_id, Operation::Get, session_id).with_models(id_models(ids))
    }

    /// Upsert of models.
    pub fn set(
        store_id: impl Into<CollectionId>,
        models: Vec<Model>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::new(store_id, Operation::Set, session_id).with_models(models)
    }

    /// Removal of models by id.
    pub fn delete(
        store_id: impl Into<CollectionId>,
        ids: &[ModelId],
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::new(store_id, Operation::Delete, session_id).with_models(id_models(ids))
    }

    /// Full collection state.
    pub fn response(
        store_id: impl Into<CollectionId>,
        models: Vec<Model>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::new(store_id, Operation::Response, session_id).with_models(models)
    }

    /// Partial update.
    pub fn update(
        store_id: impl Into<CollectionId>,
        models: Vec<Model>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::new(store_id, Operation::Update, session_id).with_models(models)
    }

    /// Command addressed to a topic.
    pub fn command(
        store_id: impl Into<CollectionId>,
        cmd: impl Into<String>,
        payload: Value,
        session_id: impl Into<SessionId>,
    ) -> Self {
        let mut message = Self::new(store_id, Operation::Cmd, session_id);
        message.cmd = Some(cmd.into());
        message.payload = Payload::Command(payload);
        message
    }

    /// Topic subscription request.
    pub fn subscribe(topic: impl Into<CollectionId>, session_id: impl Into<SessionId>) -> Self {
        Self::new(topic, Operation::Subscribe, session_id)
    }

    /// Topic subscription removal.
    pub fn unsubscribe(topic: impl Into<CollectionId>, session_id: impl Into<SessionId>) -> Self {
        Self::new(topic, Operation::Unsubscribe, session_id)
    }

    /// Subscription acknowledgement.
    pub fn subscribed(topic: impl Into<CollectionId>, session_id: impl Into<SessionId>) -> Self {
        Self::new(topic, Operation::Subscribed, session_id)
    }

    /// Keepalive frame.
    pub fn ping(session_id: impl Into<SessionId>) -> Self {
        Self::new("", Operation::Ping, session_id)
    }

    /// Models carried by the payload; empty for command payloads.
    pub fn models(&self) -> &[Model] {
        match &self.payload {
            Payload::Models(models) => models,
            Payload::Command(_) => &[],
        }
    }

    /// Take the models out of the payload.
    pub fn into_models(self) -> Vec<Model> {
        match self.payload {
            Payload::Models(models) => models,
            Payload::Command(_) => Vec::new(),
        }
    }

    /// Ids of the models carried by the payload.
    pub fn ids(&self) -> Vec<ModelId> {
        self.models().iter().map(|m| m.id.clone()).collect()
    }

    /// Whether the remote flagged the frame as not authorized.
    pub fn is_not_authorized(&self) -> bool {
        self.error_code == Some(NOT_AUTHORIZED)
    }

    /// Encode to a JSON frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Whether the payload shape fits the operation.
    pub fn is_well_formed(&self) -> bool {
        !self.operation.carries_models() || matches!(self.payload, Payload::Models(_))
    }

    /// Decode a JSON frame.
    ///
    /// Model operations whose payload does not decode as a model list are
    /// rejected rather than read as a command payload.
    pub fn decode(frame: &str) -> Result<Self> {
        let message: Self =
            serde_json::from_str(frame).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        if !message.is_well_formed() {
            return Err(Error::InvalidMessage(format!(
                "{} payload is not a model list",
                message.operation
            )));
        }
        Ok(message)
    }
}

fn id_models(ids: &[ModelId]) -> Vec<Model> {
    ids.iter().map(|id| Model::new(id.clone())).collect()
}
