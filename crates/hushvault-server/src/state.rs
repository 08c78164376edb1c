//! Shared application state.

use std::sync::Arc;

use hushvault_core::attribute::AttributeStore;
use hushvault_core::cache::TtlCache;
use hushvault_core::consent::ConsentTokenService;
use hushvault_core::ledger::StorageLedgerBackend;
use hushvault_core::session::SessionStore;
use hushvault_core::vaultkey::VaultKeyStore;
use hushvault_core::workflow::ConsentWorkflow;

use crate::events::EventHub;

/// Shared state threaded through all HTTP handlers.
pub struct AppState {
    /// Consent token issue/validate/revoke.
    pub tokens: Arc<ConsentTokenService>,
    /// Session token lifecycle.
    pub sessions: Arc<SessionStore>,
    /// Pending-consent state machine.
    pub workflow: Arc<ConsentWorkflow>,
    /// Queryable view of the consent ledger.
    pub ledger_query: Arc<StorageLedgerBackend>,
    /// Vault key envelope store.
    pub vault_keys: Arc<VaultKeyStore>,
    /// Encrypted attribute store.
    pub attributes: Arc<AttributeStore>,
    /// Per-user consent event broadcast.
    pub events: Arc<EventHub>,
    /// Caches the vault-exists probe so `GET /v1/vault/check` does not hit
    /// storage on every call.
    pub vault_cache: TtlCache<bool>,
    /// Session token lifetime.
    pub session_ttl: chrono::Duration,
    /// Consent token lifetime for owner self-issue.
    pub consent_ttl: chrono::Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("session_ttl", &self.session_ttl)
            .field("consent_ttl", &self.consent_ttl)
            .finish_non_exhaustive()
    }
}
