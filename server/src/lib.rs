//! Tessera Server - reference sync authority for Tessera collections.
//!
//! Holds collections in memory and speaks the Tessera wire protocol over a
//! single WebSocket endpoint. Intended for local development and end-to-end
//! checks of clients built on `tessera-engine`.

pub mod auth;
pub mod authority;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tessera_engine::Timestamp;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authority::Authority;
use crate::config::Config;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    pub authority: Arc<Authority>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
            authority: Arc::new(Authority::new()),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the application on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    Timestamp::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
