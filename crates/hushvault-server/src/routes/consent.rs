//! Consent token and pending-consent workflow routes.
//!
//! The validate endpoint is public — collaborating services call it with a
//! presented token. A denial there is data (`{"valid": false, ...}` with
//! 200), not a transport error: the caller's request succeeded, the token
//! just does not authorize the operation. Everything else is owner-facing
//! and session-authenticated.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use hushvault_core::error::TokenError;
use hushvault_core::ledger::LedgerEvent;
use hushvault_core::scope::Scope;
use hushvault_core::workflow::PendingRequest;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Session-authenticated consent routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/issue", post(issue))
        .route("/revoke", post(revoke))
        .route("/pending", get(list_pending))
        .route("/pending/request", post(submit_request))
        .route("/pending/approve", post(approve))
        .route("/pending/deny", post(deny))
        .route("/pending/revoke", post(revoke_granted))
        .route("/events/{user_id}", get(events))
        .route("/ledger/{user_id}", get(ledger))
}

/// Public consent routes (capability-by-possession, no session).
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/validate", post(validate))
}

#[derive(Deserialize)]
struct IssueRequest {
    agent_id: String,
    scope: String,
    /// Token lifetime; the server default applies when absent.
    ttl_secs: Option<i64>,
}

#[derive(Serialize)]
struct IssueResponse {
    token: String,
    token_id: String,
    user_id: String,
    agent_id: String,
    scope: String,
    expires_at: DateTime<Utc>,
}

/// Owner self-issues a consent token, bypassing the request/approve round
/// trip for agents they already trust.
async fn issue(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<IssueRequest>,
) -> Result<Json<IssueResponse>, AppError> {
    let scope = Scope::parse(&body.scope)?;
    let ttl = body
        .ttl_secs
        .map_or(state.consent_ttl, Duration::seconds);

    let issued = state
        .tokens
        .issue(&auth.user_id, &body.agent_id, scope, ttl)
        .await?;

    Ok(Json(IssueResponse {
        token: issued.token,
        token_id: issued.claims.token_id,
        user_id: issued.claims.user_id,
        agent_id: issued.claims.agent_id,
        scope: issued.claims.scope.to_string(),
        expires_at: issued.claims.expires_at,
    }))
}

#[derive(Deserialize)]
struct ValidateRequest {
    token: String,
    /// When present, the token's scope must satisfy it. When absent only
    /// structure, signature, expiry, and revocation are checked.
    scope: Option<String>,
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

/// Validate a presented consent token, optionally against a requested scope.
async fn validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    let requested = body.scope.as_deref().map(Scope::parse).transpose()?;

    match state.tokens.validate(&body.token, requested.as_ref()).await {
        Ok(claims) => Ok(Json(ValidateResponse {
            valid: true,
            reason: None,
            user_id: Some(claims.user_id),
            agent_id: Some(claims.agent_id),
            scope: Some(claims.scope.to_string()),
        })),
        Err(TokenError::Denied(reason)) => {
            debug!(reason = %reason, "token validation denied");
            Ok(Json(ValidateResponse {
                valid: false,
                reason: Some(reason.code()),
                user_id: None,
                agent_id: None,
                scope: None,
            }))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Deserialize)]
struct RevokeRequest {
    token_id: String,
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: bool,
}

/// Revoke one of the caller's consent tokens. Idempotent; the response does
/// not reveal whether the id existed.
async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RevokeRequest>,
) -> Result<Json<RevokeResponse>, AppError> {
    state.tokens.revoke_owned(&auth.user_id, &body.token_id).await?;
    Ok(Json(RevokeResponse { revoked: true }))
}

#[derive(Deserialize)]
struct SubmitRequest {
    agent_id: String,
    scope: String,
}

/// File a pending consent request for the authenticated owner's decision.
async fn submit_request(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<PendingRequest>, AppError> {
    let scope = Scope::parse(&body.scope)?;
    let request = state
        .workflow
        .submit(&auth.user_id, &body.agent_id, scope)
        .await?;
    Ok(Json(request))
}

/// All of the caller's requests still awaiting a decision.
async fn list_pending(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<PendingRequest>>, AppError> {
    Ok(Json(state.workflow.list_pending(&auth.user_id).await?))
}

#[derive(Deserialize)]
struct DecisionRequest {
    request_id: String,
}

#[derive(Serialize)]
struct ApproveResponse {
    request: PendingRequest,
    /// The issued consent token, returned exactly once. The owner hands it
    /// to the agent; the server keeps only the revocation record.
    token: String,
    token_id: String,
    expires_at: DateTime<Utc>,
}

/// Approve a pending request and receive the issued token.
async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<ApproveResponse>, AppError> {
    let (request, issued) = state.workflow.approve(&auth.user_id, &body.request_id).await?;
    Ok(Json(ApproveResponse {
        request,
        token: issued.token,
        token_id: issued.claims.token_id,
        expires_at: issued.claims.expires_at,
    }))
}

/// Deny a pending request.
async fn deny(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<PendingRequest>, AppError> {
    Ok(Json(state.workflow.deny(&auth.user_id, &body.request_id).await?))
}

/// Revoke a previously granted request, revoking its token with it.
async fn revoke_granted(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<PendingRequest>, AppError> {
    // revoke_granted has no owner parameter; enforce ownership here.
    let request = state.workflow.get(&body.request_id).await?;
    if request.user_id != auth.user_id {
        return Err(hushvault_core::error::DenyReason::UserMismatch.into());
    }
    Ok(Json(state.workflow.revoke_granted(&body.request_id).await?))
}

/// SSE stream of the caller's consent events, with keep-alive heartbeats.
async fn events(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if auth.user_id != user_id {
        return Err(hushvault_core::error::DenyReason::UserMismatch.into());
    }

    let rx = state.events.subscribe(&user_id);
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default()
                .event("consent")
                .json_data(&event)
                .ok()
                .map(Ok),
            // Lagged receiver: skip; the consumer reconciles via the ledger.
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(StdDuration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// The caller's full consent ledger, oldest first.
async fn ledger(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<LedgerEvent>>, AppError> {
    if auth.user_id != user_id {
        return Err(hushvault_core::error::DenyReason::UserMismatch.into());
    }
    Ok(Json(state.ledger_query.query_user(&user_id).await?))
}
