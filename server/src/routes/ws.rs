//! WebSocket upgrade route.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Session the connection speaks for
    pub session: String,
}

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade_handler))
}

/// GET /ws?session=<id> - Upgrade to a sync connection.
async fn upgrade_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if query.session.is_empty() {
        return Err(AppError::BadRequest("session must not be empty".into()));
    }

    let session_id = query.session;
    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, session_id)))
}
