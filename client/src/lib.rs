//! # Tessera Client
//!
//! Tokio runtime for [`tessera_engine`]: drives an [`Engine`]'s timers with
//! the wall clock and carries its sync session over a WebSocket.
//!
//! ```no_run
//! use tessera_client::{ClientConfig, SyncClient};
//! use tessera_engine::{CollectionOptions, Engine, Model, SelectPolicy, SyncMode};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("ws://localhost:3000/ws", "session-1");
//! let mut engine = Engine::new().with_sync(config.sync_options());
//! engine.create_collection(
//!     CollectionOptions::new("todos").sync_mode(SyncMode::Auto),
//!     tessera_client::now_millis(),
//! )?;
//!
//! let client = SyncClient::start(engine, config);
//! client
//!     .with_engine(|engine, now| {
//!         let todo = Model::new("1").with_field("title", "Buy milk");
//!         engine
//!             .collection_mut("todos")
//!             .map(|todos| todos.set(todo, SelectPolicy::Never, true, now))
//!     })
//!     .await?;
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod runtime;

pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, Result};
pub use link::{ChannelLink, LinkEvent};
pub use runtime::SyncClient;

use tessera_engine::Timestamp;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    Timestamp::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
