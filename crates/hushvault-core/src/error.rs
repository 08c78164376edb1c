//! Error types for `hushvault-core`.
//!
//! Each variant carries enough context to diagnose the problem without a
//! debugger. Crypto errors never include key material or plaintext — only
//! identifiers and operation descriptions.

use serde::{Deserialize, Serialize};

use hushvault_storage::StorageError;

/// Typed denial reasons surfaced to collaborators.
///
/// Every authorization failure maps to exactly one of these codes — denial
/// is always explicit, never a silent drop or a raw exception. The serialized
/// form is the SCREAMING_SNAKE_CASE code collaborators match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// No identity proof was presented.
    AuthRequired,
    /// The presented identity proof failed verification.
    AuthInvalid,
    /// The operation requires a consent token and none was presented.
    ConsentRequired,
    /// The presented consent token failed structural or signature checks.
    /// Deliberately generic: callers learn nothing about which check failed.
    TokenInvalid,
    /// The consent token's `expires_at` has passed.
    TokenExpired,
    /// The consent token was revoked.
    TokenRevoked,
    /// The token's scope does not satisfy the requested scope.
    ScopeMismatch,
    /// The acting user is not the user named by the resource or request.
    UserMismatch,
    /// The operation requires a live session token.
    SessionRequired,
}

impl DenyReason {
    /// The wire-format reason code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::ConsentRequired => "CONSENT_REQUIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::ScopeMismatch => "SCOPE_MISMATCH",
            Self::UserMismatch => "USER_MISMATCH",
            Self::SessionRequired => "SESSION_REQUIRED",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or
    /// tampered tag). Always a hard failure — no partial plaintext.
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation (Argon2id or HKDF) failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// A field of an encrypted payload was not valid base64 or had an
    /// impossible length.
    #[error("malformed encrypted payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Errors from scope parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScopeError {
    /// The scope string is empty or has an empty segment.
    #[error("invalid scope '{scope}': {reason}")]
    Invalid { scope: String, reason: String },
}

/// Errors from consent token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token failed validation; the reason says why. This is a normal
    /// outcome for `validate`, not an internal fault.
    #[error("token denied: {0}")]
    Denied(DenyReason),

    /// Serialization of a token payload or record failed.
    #[error("token serialization failed: {reason}")]
    Serialization { reason: String },

    /// The requested TTL was zero or negative.
    #[error("invalid token ttl: {reason}")]
    InvalidTtl { reason: String },

    /// The ledger refused the required audit write (fail-closed).
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    /// The underlying storage backend failed.
    #[error("token storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from session token operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session record matches the presented token's hash, or the session
    /// has been logged out.
    #[error("session denied: {0}")]
    Denied(DenyReason),

    /// Serialization of a session record failed.
    #[error("session serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying storage backend failed.
    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the consent ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// All ledger backends failed to write — the gated operation must be
    /// denied (fail-closed).
    #[error("all ledger backends failed (fail-closed)")]
    AllBackendsFailed,

    /// A specific ledger backend failed.
    #[error("ledger backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// Serialization of a ledger event failed.
    #[error("ledger serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying storage backend failed while reading events.
    #[error("ledger storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the pending-consent workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The request id does not exist.
    #[error("consent request not found: {request_id}")]
    NotFound { request_id: String },

    /// The transition is not legal from the request's current status.
    /// First-writer-wins: a concurrent decision already landed, or the
    /// request is already terminal. No state was mutated.
    #[error("invalid transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: String,
        to: String,
    },

    /// The acting user is not the user the request names.
    #[error("user mismatch for request {request_id}")]
    UserMismatch { request_id: String },

    /// Granting consent failed while issuing the token.
    #[error("token issuance on grant failed: {0}")]
    Issuance(#[from] TokenError),

    /// Serialization of a request record failed.
    #[error("workflow serialization failed: {reason}")]
    Serialization { reason: String },

    /// The ledger refused the required audit write.
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    /// The underlying storage backend failed.
    #[error("workflow storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from vault key envelope operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultKeyError {
    /// A vault already exists for this user. Setup is one-shot; rewrapping
    /// goes through an explicit rotation, never a silent overwrite.
    #[error("vault already exists for user")]
    AlreadyExists,

    /// No vault key envelope exists for this user.
    #[error("vault not found for user")]
    NotFound,

    /// A wrapped-copy field was malformed (bad base64, wrong length).
    #[error("invalid key envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// A cryptographic operation failed during wrap/unwrap.
    #[error("vault key crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization of the envelope record failed.
    #[error("vault key serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying storage backend failed.
    #[error("vault key storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the encrypted attribute store.
#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    /// No attribute exists at `(user_id, domain, attribute_key)`.
    #[error("attribute not found: {domain}/{attribute_key}")]
    NotFound {
        domain: String,
        attribute_key: String,
    },

    /// A `domain` or `attribute_key` the record key cannot carry.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// The record's declared algorithm is not one this store accepts.
    #[error("unsupported algorithm '{algorithm}'")]
    UnsupportedAlgorithm { algorithm: String },

    /// Serialization of an attribute record failed.
    #[error("attribute serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying storage backend failed.
    #[error("attribute storage error: {0}")]
    Storage(#[from] StorageError),
}
