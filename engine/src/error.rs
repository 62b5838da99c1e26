//! Error types for the Tessera engine.
//!
//! Data and network failures inside the engine are logged and degraded
//! (boolean results, dropped frames). The variants here cover the cases that
//! do surface to the caller: programmer misuse detected at call time and
//! decoding failures reported by the codec helpers.

use crate::CollectionId;
use thiserror::Error;

/// All possible errors from the Tessera engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Registry misuse
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    #[error("collection already exists: {0}")]
    DuplicateCollection(CollectionId),

    // Model errors
    #[error("invalid model: {0}")]
    InvalidModel(String),

    // Codec errors
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    // Sync errors
    #[error("engine has no sync session")]
    SyncDisabled,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
