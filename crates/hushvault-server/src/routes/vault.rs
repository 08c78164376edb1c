//! Vault key envelope and encrypted attribute routes.
//!
//! Setup and status are owner-facing, session-authenticated. The attribute
//! routes are capability-gated instead: the caller presents a consent token
//! in `X-Consent-Token` and the handler validates it against the exact scope
//! the operation needs (`vault.write.{domain}` / `vault.read.{domain}`). The
//! server stores ciphertext it cannot open either way.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use hushvault_core::attribute::EncryptedAttribute;
use hushvault_core::crypto::EncryptedPayload;
use hushvault_core::error::DenyReason;
use hushvault_core::scope::Scope;
use hushvault_core::vaultkey::{AuthMethod, VaultKeyRecord, WrappedKey};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::routes::CONSENT_TOKEN_HEADER;
use crate::state::AppState;

/// Cache resource name for the vault-exists probe.
const VAULT_EXISTS: &str = "vault_exists";

/// Session-authenticated vault key routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/setup", post(setup))
        .route("/check", get(check))
        .route("/keys", get(keys))
}

/// Consent-token-gated attribute routes (no session).
pub fn consent_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/attributes", post(write_attribute))
        .route("/attributes/{user_id}", get(read_attributes))
}

#[derive(Deserialize)]
struct SetupRequest {
    passphrase_wrapped: WrappedKey,
    recovery_wrapped: WrappedKey,
    auth_method: AuthMethod,
}

#[derive(Serialize)]
struct SetupResponse {
    user_id: String,
    created: bool,
}

/// Store the caller's dual-wrapped vault key envelope. One-shot per user.
async fn setup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    let record = VaultKeyRecord {
        user_id: auth.user_id.clone(),
        passphrase_wrapped: body.passphrase_wrapped,
        recovery_wrapped: body.recovery_wrapped,
        auth_method: body.auth_method,
        created_at: Utc::now(),
    };
    state.vault_keys.setup(&record).await?;
    state.vault_cache.put(&auth.user_id, VAULT_EXISTS, true).await;

    Ok(Json(SetupResponse {
        user_id: auth.user_id,
        created: true,
    }))
}

#[derive(Serialize)]
struct CheckResponse {
    exists: bool,
}

/// Whether the caller has a vault. Cached briefly; setup invalidates by
/// overwriting the cached value.
async fn check(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<CheckResponse>, AppError> {
    if let Some(exists) = state.vault_cache.get(&auth.user_id, VAULT_EXISTS).await {
        return Ok(Json(CheckResponse { exists }));
    }

    let exists = state.vault_keys.exists(&auth.user_id).await?;
    state.vault_cache.put(&auth.user_id, VAULT_EXISTS, exists).await;
    Ok(Json(CheckResponse { exists }))
}

/// Return the caller's wrapped key envelope for client-side unwrap.
async fn keys(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<VaultKeyRecord>, AppError> {
    Ok(Json(state.vault_keys.get(&auth.user_id).await?))
}

#[derive(Deserialize)]
struct WriteAttributeRequest {
    /// The data owner the write concerns. Must match the token's subject.
    user_id: String,
    domain: String,
    attribute_key: String,
    #[serde(flatten)]
    payload: EncryptedPayload,
    source: Option<String>,
    confidence: Option<f64>,
    display_name: Option<String>,
}

/// Write one encrypted attribute, gated on `vault.write.{domain}`.
async fn write_attribute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<WriteAttributeRequest>,
) -> Result<Json<EncryptedAttribute>, AppError> {
    let token = consent_token(&headers)?;
    let required = Scope::parse(&format!("vault.write.{}", body.domain))
        .map_err(|_| AppError::BadRequest(format!("invalid domain '{}'", body.domain)))?;

    let claims = state.tokens.validate(token, Some(&required)).await?;
    if claims.user_id != body.user_id {
        return Err(DenyReason::UserMismatch.into());
    }

    let stored = state
        .attributes
        .upsert(
            &body.user_id,
            EncryptedAttribute {
                domain: body.domain,
                attribute_key: body.attribute_key,
                payload: body.payload,
                source: body.source,
                confidence: body.confidence,
                display_name: body.display_name,
                updated_at: Utc::now(),
            },
        )
        .await?;
    Ok(Json(stored))
}

#[derive(Deserialize)]
struct ReadQuery {
    domain: Option<String>,
}

/// Read a user's encrypted attributes, gated on `vault.read.{domain}` (or
/// `vault.read.*` when no domain filter is given).
async fn read_attributes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Vec<EncryptedAttribute>>, AppError> {
    let token = consent_token(&headers)?;
    let required = match query.domain.as_deref() {
        Some(domain) => Scope::parse(&format!("vault.read.{domain}"))
            .map_err(|_| AppError::BadRequest(format!("invalid domain '{domain}'")))?,
        None => Scope::parse("vault.read.*")?,
    };

    let claims = state.tokens.validate(token, Some(&required)).await?;
    if claims.user_id != user_id {
        return Err(DenyReason::UserMismatch.into());
    }

    Ok(Json(
        state.attributes.list(&user_id, query.domain.as_deref()).await?,
    ))
}

fn consent_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(CONSENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Denied(DenyReason::ConsentRequired))
}
