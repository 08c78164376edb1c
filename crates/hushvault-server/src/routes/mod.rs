//! HTTP route handlers.

pub mod consent;
pub mod session;
pub mod sys;
pub mod vault;

/// Header carrying a consent token for capability-gated routes.
pub const CONSENT_TOKEN_HEADER: &str = "X-Consent-Token";
