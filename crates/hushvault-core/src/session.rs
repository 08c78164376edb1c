//! Session tokens.
//!
//! A session token proves "this caller is user X" for owner-facing
//! operations. It is a 256-bit random bearer value returned exactly once at
//! issue time; the store persists only its SHA-256 hash, so a storage dump
//! cannot be replayed as live credentials. Authorization is by possession
//! plus a server-side active flag, which gives immediate revocation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hushvault_storage::StorageBackend;

use crate::crypto;
use crate::error::{DenyReason, SessionError};

/// Storage prefix for session records, keyed by token hash.
const RECORD_PREFIX: &str = "sessions/";

/// Scope marker carried by every session record.
const SESSION_SCOPE: &str = "session";

/// Persisted per-session record. `token_hash` is the only credential
/// material stored; the raw token never touches storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The authenticated user.
    pub user_id: String,
    /// SHA-256 hex of the raw bearer token.
    pub token_hash: String,
    /// Always `"session"` — session tokens carry no vault capabilities.
    pub scope: String,
    /// When the session was issued.
    pub created_at: DateTime<Utc>,
    /// When the session stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Cleared on logout.
    pub is_active: bool,
    /// Client address at issue time, for audit review.
    pub ip_address: Option<String>,
    /// Client user agent at issue time.
    pub user_agent: Option<String>,
}

/// A freshly issued session: the raw token (shown once) and its record.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// The raw bearer token. Not retained anywhere server-side.
    pub token: String,
    /// The persisted record.
    pub record: SessionRecord,
}

/// Issues and authenticates session tokens over the storage backend.
pub struct SessionStore {
    storage: Arc<dyn StorageBackend>,
}

impl SessionStore {
    /// Create a store over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Issue a new session for `user_id`, valid for `ttl`.
    ///
    /// The caller is responsible for having verified the user's identity
    /// before calling this; the store records, it does not judge.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] or [`SessionError::Serialization`]
    /// if the record could not be persisted.
    pub async fn issue(
        &self,
        user_id: &str,
        ttl: Duration,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<IssuedSession, SessionError> {
        let token = crypto::generate_bearer_token();
        let now = Utc::now();
        let record = SessionRecord {
            user_id: user_id.to_owned(),
            token_hash: crypto::hash_token(&token),
            scope: SESSION_SCOPE.to_owned(),
            created_at: now,
            expires_at: now + ttl,
            is_active: true,
            ip_address,
            user_agent,
        };
        self.put_record(&record).await?;

        info!(user_id, expires_at = %record.expires_at, "session issued");
        Ok(IssuedSession { token, record })
    }

    /// Authenticate a raw session token.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Denied`] with `SESSION_REQUIRED` if no record
    ///   matches the token's hash or the session was logged out, or
    ///   `TOKEN_EXPIRED` if the session's lifetime has passed.
    /// - [`SessionError::Storage`] on backend failure.
    pub async fn authenticate(&self, raw_token: &str) -> Result<SessionRecord, SessionError> {
        let hash = crypto::hash_token(raw_token);
        let Some(record) = self.get_record(&hash).await? else {
            debug!("session rejected: unknown token");
            return Err(SessionError::Denied(DenyReason::SessionRequired));
        };

        if !record.is_active {
            debug!(user_id = %record.user_id, "session rejected: logged out");
            return Err(SessionError::Denied(DenyReason::SessionRequired));
        }

        if Utc::now() >= record.expires_at {
            debug!(user_id = %record.user_id, "session rejected: expired");
            return Err(SessionError::Denied(DenyReason::TokenExpired));
        }

        Ok(record)
    }

    /// Invalidate a session (logout). Idempotent: an unknown or already
    /// logged-out token is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] on backend failure.
    pub async fn invalidate(&self, raw_token: &str) -> Result<(), SessionError> {
        let hash = crypto::hash_token(raw_token);
        if let Some(mut record) = self.get_record(&hash).await? {
            if record.is_active {
                record.is_active = false;
                self.put_record(&record).await?;
                info!(user_id = %record.user_id, "session invalidated");
            }
        }
        Ok(())
    }

    async fn get_record(&self, hash: &str) -> Result<Option<SessionRecord>, SessionError> {
        let key = format!("{RECORD_PREFIX}{hash}");
        match self.storage.get(&key).await? {
            Some(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|e| SessionError::Serialization {
                        reason: format!("corrupt session record: {e}"),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put_record(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let key = format!("{RECORD_PREFIX}{}", record.token_hash);
        let bytes = serde_json::to_vec(record).map_err(|e| SessionError::Serialization {
            reason: e.to_string(),
        })?;
        self.storage.put(&key, &bytes).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}
