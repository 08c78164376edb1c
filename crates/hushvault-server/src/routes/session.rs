//! Session lifecycle routes.
//!
//! Session issue sits behind the deployment's identity provider: the proxy
//! in front of this server verifies the user's identity and forwards the
//! verified id. The endpoint itself performs no password or OIDC exchange —
//! it converts an already-proven identity into a bearer session.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Public session routes (the login boundary).
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/issue", post(issue))
}

/// Session-authenticated routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/logout", post(logout))
}

#[derive(Deserialize)]
struct IssueRequest {
    /// Identity-provider-verified user id.
    user_id: String,
}

#[derive(Serialize)]
struct IssueResponse {
    /// The session bearer token, returned exactly once.
    token: String,
    user_id: String,
    expires_at: DateTime<Utc>,
}

async fn issue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IssueRequest>,
) -> Result<Json<IssueResponse>, AppError> {
    if body.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id must not be empty".to_owned()));
    }

    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned());
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let issued = state
        .sessions
        .issue(&body.user_id, state.session_ttl, ip_address, user_agent)
        .await?;

    Ok(Json(IssueResponse {
        token: issued.token,
        user_id: issued.record.user_id,
        expires_at: issued.record.expires_at,
    }))
}

#[derive(Serialize)]
struct LogoutResponse {
    logged_out: bool,
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<LogoutResponse>, AppError> {
    state.sessions.invalidate(&auth.session_token).await?;
    Ok(Json(LogoutResponse { logged_out: true }))
}
