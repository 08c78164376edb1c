//! Session authentication middleware.
//!
//! Extracts the `X-Session-Token` header, authenticates it against the
//! session store, and injects an [`AuthContext`] into the request extensions
//! for downstream handlers. Routes gated by consent tokens instead of
//! sessions (attribute read/write, token validation) do not pass through
//! this layer.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use hushvault_core::error::{DenyReason, SessionError};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the session bearer token.
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";

/// Authenticated caller identity, injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The authenticated user.
    pub user_id: String,
    /// The raw session token, kept for logout.
    pub session_token: String,
}

/// Middleware that authenticates the `X-Session-Token` header.
pub async fn session_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let Some(token) = token else {
        return AppError::Denied(DenyReason::AuthRequired).into_response();
    };

    match state.sessions.authenticate(&token).await {
        Ok(record) => {
            req.extensions_mut().insert(AuthContext {
                user_id: record.user_id,
                session_token: token,
            });
            next.run(req).await
        }
        Err(SessionError::Denied(_)) => {
            // Unknown, logged-out, and expired all collapse to the same
            // response so session hashes cannot be probed.
            debug!("session authentication failed");
            AppError::Denied(DenyReason::AuthInvalid).into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}
