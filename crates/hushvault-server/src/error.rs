//! HTTP error types for the hushvault server.
//!
//! Maps domain errors from `hushvault-core` into HTTP responses. Every error
//! produces a JSON body with a machine-readable `error` code and a
//! human-readable `message`. Authorization denials carry their
//! [`DenyReason`] code verbatim so collaborators can match on it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use hushvault_core::error::{
    AttributeError, DenyReason, LedgerError, ScopeError, SessionError, TokenError, VaultKeyError,
    WorkflowError,
};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// An authorization denial with its typed reason code.
    Denied(DenyReason),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// A conflict (e.g., vault already set up, decision already made).
    Conflict(String),
    /// Internal server error (storage, ledger, serialization).
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            Self::Denied(reason) => (
                status_for(reason),
                reason.code().to_owned(),
                deny_message(reason).to_owned(),
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found".to_owned(), msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request".to_owned(), msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict".to_owned(), msg),
            Self::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error".to_owned(),
                msg,
            ),
        };

        let body = ErrorBody {
            error: error_code,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Status code for each denial reason.
fn status_for(reason: DenyReason) -> StatusCode {
    match reason {
        DenyReason::AuthRequired | DenyReason::AuthInvalid => StatusCode::UNAUTHORIZED,
        DenyReason::ConsentRequired
        | DenyReason::TokenInvalid
        | DenyReason::TokenExpired
        | DenyReason::TokenRevoked
        | DenyReason::ScopeMismatch
        | DenyReason::UserMismatch
        | DenyReason::SessionRequired => StatusCode::FORBIDDEN,
    }
}

/// Stable human-readable text per denial reason. Deliberately unspecific for
/// `TOKEN_INVALID` — the response must not say which check failed.
fn deny_message(reason: DenyReason) -> &'static str {
    match reason {
        DenyReason::AuthRequired => "authentication required",
        DenyReason::AuthInvalid => "invalid or expired credentials",
        DenyReason::ConsentRequired => "a consent token is required for this operation",
        DenyReason::TokenInvalid => "consent token is invalid",
        DenyReason::TokenExpired => "consent token has expired",
        DenyReason::TokenRevoked => "consent token has been revoked",
        DenyReason::ScopeMismatch => "consent token does not cover the requested scope",
        DenyReason::UserMismatch => "operation concerns a different user",
        DenyReason::SessionRequired => "a live session is required for this operation",
    }
}

impl From<DenyReason> for AppError {
    fn from(reason: DenyReason) -> Self {
        Self::Denied(reason)
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Denied(reason) => Self::Denied(reason),
            TokenError::InvalidTtl { .. } => Self::BadRequest(err.to_string()),
            TokenError::Serialization { .. } | TokenError::Storage(_) | TokenError::Ledger(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Denied(reason) => Self::Denied(reason),
            SessionError::Serialization { .. } | SessionError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound { .. } => Self::NotFound(err.to_string()),
            WorkflowError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            WorkflowError::UserMismatch { .. } => Self::Denied(DenyReason::UserMismatch),
            WorkflowError::Issuance(inner) => inner.into(),
            WorkflowError::Serialization { .. }
            | WorkflowError::Ledger(_)
            | WorkflowError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<VaultKeyError> for AppError {
    fn from(err: VaultKeyError) -> Self {
        match err {
            VaultKeyError::AlreadyExists => Self::Conflict(err.to_string()),
            VaultKeyError::NotFound => Self::NotFound(err.to_string()),
            VaultKeyError::InvalidEnvelope { .. } => Self::BadRequest(err.to_string()),
            VaultKeyError::Crypto(_)
            | VaultKeyError::Serialization { .. }
            | VaultKeyError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<AttributeError> for AppError {
    fn from(err: AttributeError) -> Self {
        match err {
            AttributeError::NotFound { .. } => Self::NotFound(err.to_string()),
            AttributeError::InvalidField { .. } | AttributeError::UnsupportedAlgorithm { .. } => {
                Self::BadRequest(err.to_string())
            }
            AttributeError::Serialization { .. } | AttributeError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        // AllBackendsFailed means the gated operation was denied fail-closed;
        // surfaced as 500 because the outage is ours, not the caller's.
        Self::Internal(err.to_string())
    }
}

impl From<ScopeError> for AppError {
    fn from(err: ScopeError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deny_reasons_map_to_expected_statuses() {
        assert_eq!(status_for(DenyReason::AuthRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(DenyReason::AuthInvalid), StatusCode::UNAUTHORIZED);
        for reason in [
            DenyReason::ConsentRequired,
            DenyReason::TokenInvalid,
            DenyReason::TokenExpired,
            DenyReason::TokenRevoked,
            DenyReason::ScopeMismatch,
            DenyReason::UserMismatch,
            DenyReason::SessionRequired,
        ] {
            assert_eq!(status_for(reason), StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn token_invalid_message_names_no_specific_check() {
        let msg = deny_message(DenyReason::TokenInvalid);
        for needle in ["signature", "payload", "base64", "structure", "hmac"] {
            assert!(!msg.contains(needle));
        }
    }

    #[test]
    fn workflow_conflicts_map_to_409() {
        let err = WorkflowError::InvalidTransition {
            request_id: "req-1".to_owned(),
            from: "CONSENT_DENIED".to_owned(),
            to: "CONSENT_GRANTED".to_owned(),
        };
        let app: AppError = err.into();
        assert!(matches!(app, AppError::Conflict(_)));
    }

    #[test]
    fn vault_setup_twice_maps_to_409() {
        let app: AppError = VaultKeyError::AlreadyExists.into();
        assert!(matches!(app, AppError::Conflict(_)));
    }
}
