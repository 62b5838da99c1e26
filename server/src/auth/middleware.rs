//! Authentication middleware.
//!
//! Bearer token extraction. When `AUTH_SECRET` is configured the token must
//! equal it; otherwise every request is accepted as anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" when auth is disabled
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        authorize(header, state.config.auth_secret.as_deref())
    }
}

/// Check an `Authorization` header against the configured secret.
pub fn authorize(header: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    let Some(secret) = secret else {
        return Ok(AuthUser {
            token: "anonymous".to_string(),
        });
    };

    let header = header.ok_or(AppError::Unauthorized("missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized("invalid authorization header format"))?;

    if token.is_empty() {
        return Err(AppError::Unauthorized("empty bearer token"));
    }
    if token != secret {
        return Err(AppError::Unauthorized("invalid token"));
    }

    Ok(AuthUser {
        token: token.to_string(),
    })
}
