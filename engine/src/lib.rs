//! # Tessera Engine
//!
//! A deterministic, sans-IO engine for client-side collections that stay in
//! sync with a remote authority.
//!
//! The engine keeps named collections of JSON models in memory, tracks what
//! changed since the last report, coalesces bursts of mutations into one
//! notification and one change set, and exchanges those change sets with the
//! remote over a JSON wire protocol.
//!
//! ## Design Principles
//!
//! - **No IO**: sockets and clocks belong to the host; every call takes `now`
//! - **Deterministic**: same calls in the same order, same state and frames
//! - **Degrade, don't crash**: data and network failures are logged and
//!   reported as `false` or [`Delivery::Dropped`]; only registry misuse errors
//!
//! ## Core Concepts
//!
//! ### Models
//!
//! A [`Model`] is an id, four reserved timestamps and an open map of domain
//! fields. `changed_at` marks an unacknowledged local edit (the model is
//! *dirty*).
//!
//! ### Storage and change sets
//!
//! [`Storage`] holds one collection and accumulates inserted, updated,
//! deleted and previous-state entries until drained into a [`DiffReport`].
//!
//! ### Collections
//!
//! A [`Collection`] adds selection, a [`SyncMode`] and two debounce stages:
//! a short one broadcasting the models to subscribers, a long one draining
//! the change set into history, the link and persistence.
//!
//! ### Sync
//!
//! [`SyncSession`] is the connection state machine: reconnect after a close,
//! keepalive pings, topic subscriptions and the session-id filter. Incoming
//! full responses replace a collection, partial updates patch it; conflicts
//! are resolved last-write-wins (see [`merge`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_engine::{
//!     CollectionOptions, Engine, LinkRequest, Model, RecordingLink, SelectPolicy, SyncMode,
//!     SyncOptions,
//! };
//!
//! let mut engine = Engine::new().with_sync(SyncOptions::new("session-1"));
//! engine
//!     .create_collection(
//!         CollectionOptions::new("users").sync_mode(SyncMode::Auto).auto_select(true),
//!         0,
//!     )
//!     .unwrap();
//!
//! // The host opens a socket when asked to and hands over a link.
//! assert_eq!(engine.poll(0), Some(LinkRequest::Connect));
//! let link = RecordingLink::new();
//! engine.on_open(link.clone(), 0);
//!
//! let users = engine.collection_mut("users").unwrap();
//! users.set(Model::new("1").with_field("name", "Alice"), SelectPolicy::IfEmpty, true, 100);
//!
//! // Notify after 10 ms, drain and send after another 2 s.
//! engine.poll(110);
//! engine.poll(2_110);
//!
//! assert_eq!(engine.history().len(), 1);
//! assert!(link.take().iter().any(|frame| frame.contains("\"operation\":\"set\"")));
//! ```

pub mod collection;
pub mod diff;
pub mod engine;
pub mod error;
pub mod history;
pub mod merge;
pub mod model;
pub mod notifier;
pub mod persistence;
pub mod protocol;
pub mod schedule;
pub mod storage;
pub mod sync;

// Re-export main types at crate root
pub use collection::{Collection, CollectionOptions, SelectPolicy, SetReason, SyncMode};
pub use diff::is_different;
pub use engine::{Delivery, DropReason, Engine};
pub use error::Error;
pub use history::History;
pub use merge::{resolve, Resolution};
pub use model::Model;
pub use notifier::{Notifier, SubscriptionId};
pub use persistence::{MemoryPersistence, Persistence};
pub use protocol::{Operation, Payload, WireMessage, NOT_AUTHORIZED};
pub use schedule::{Debounce, Timings};
pub use storage::{DiffReport, Storage, Window};
pub use sync::{Link, LinkError, LinkRequest, LinkState, SyncOptions, SyncSession};
#[cfg(any(test, feature = "test-util"))]
pub use sync::RecordingLink;

/// Type aliases for clarity
pub type ModelId = String;
pub type CollectionId = String;
pub type SessionId = String;
pub type Timestamp = u64;
