//! Client error types.

use crate::config::ConfigError;

/// Errors surfaced by the client runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] tessera_engine::Error),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("driver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias for the client.
pub type Result<T> = std::result::Result<T, ClientError>;
