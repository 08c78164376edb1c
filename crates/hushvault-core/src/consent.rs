//! Signed consent tokens.
//!
//! A consent token is the owner's capability grant to an agent: a JSON claims
//! payload signed with HMAC-SHA256 and carried on the wire as
//! `HCT:<base64 payload>.<hex signature>`. The signing key is held exclusively
//! by [`ConsentTokenService`]; possession of a validly-signed, unexpired,
//! unrevoked token with a satisfying scope is what authorizes an operation.
//!
//! Validation is deliberately oracle-free: any structural or signature
//! failure collapses to the single reason `TOKEN_INVALID`. Only tokens that
//! pass signature verification get the finer-grained reasons, checked in
//! fixed order: expiry, then revocation, then scope.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hushvault_storage::StorageBackend;

use crate::crypto::{self, SigningKey};
use crate::error::{DenyReason, TokenError};
use crate::ledger::{ConsentLedger, LedgerAction, LedgerEvent};
use crate::scope::Scope;

/// Wire prefix marking a consent token.
pub const TOKEN_PREFIX: &str = "HCT:";

/// Storage prefix for token records.
const RECORD_PREFIX: &str = "consent/tokens/";

/// The signed claims inside a consent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentClaims {
    /// Unique token id, used for revocation and ledger correlation.
    pub token_id: String,
    /// The data owner who granted this capability.
    pub user_id: String,
    /// The agent the capability was granted to.
    pub agent_id: String,
    /// What the token authorizes.
    pub scope: Scope,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// A freshly issued token: the wire string (returned to the caller exactly
/// once) plus its claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The full `HCT:...` wire form.
    pub token: String,
    /// The claims the wire form carries.
    pub claims: ConsentClaims,
}

/// Server-side record kept per issued token, for revocation lookup. The
/// record is not authoritative for the claims — the signature is — but it is
/// authoritative for revocation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    token_id: String,
    user_id: String,
    agent_id: String,
    scope: Scope,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

/// Issues, validates, and revokes consent tokens.
///
/// Owns the HMAC signing key exclusively. Every operation appends to the
/// consent ledger before its result is returned; a ledger write failure
/// denies the operation (fail-closed).
pub struct ConsentTokenService {
    signing_key: SigningKey,
    storage: Arc<dyn StorageBackend>,
    ledger: Arc<ConsentLedger>,
}

impl ConsentTokenService {
    /// Create a service around the given signing key, storage, and ledger.
    #[must_use]
    pub fn new(
        signing_key: SigningKey,
        storage: Arc<dyn StorageBackend>,
        ledger: Arc<ConsentLedger>,
    ) -> Self {
        Self {
            signing_key,
            storage,
            ledger,
        }
    }

    /// Issue a consent token for `agent_id` over `scope`, valid for `ttl`.
    ///
    /// # Errors
    ///
    /// - [`TokenError::InvalidTtl`] if `ttl` is zero or negative.
    /// - [`TokenError::Ledger`] if the issue event could not be ledgered;
    ///   no token is returned in that case.
    /// - [`TokenError::Storage`] if the revocation record could not be
    ///   persisted.
    pub async fn issue(
        &self,
        user_id: &str,
        agent_id: &str,
        scope: Scope,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        if ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl {
                reason: format!("ttl must be positive, got {}s", ttl.num_seconds()),
            });
        }

        let now = Utc::now();
        let claims = ConsentClaims {
            token_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            agent_id: agent_id.to_owned(),
            scope,
            issued_at: now,
            expires_at: now + ttl,
        };

        let payload = serde_json::to_vec(&claims).map_err(|e| TokenError::Serialization {
            reason: e.to_string(),
        })?;
        let signature = crypto::sign(&self.signing_key, &payload);
        let token = format!(
            "{TOKEN_PREFIX}{}.{}",
            BASE64.encode(&payload),
            hex::encode(signature)
        );

        let record = TokenRecord {
            token_id: claims.token_id.clone(),
            user_id: claims.user_id.clone(),
            agent_id: claims.agent_id.clone(),
            scope: claims.scope.clone(),
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
            revoked_at: None,
        };
        self.put_record(&record).await?;

        self.ledger
            .append(
                &LedgerEvent::new(LedgerAction::Issue, &claims.user_id)
                    .agent(&claims.agent_id)
                    .token(&claims.token_id)
                    .scope(claims.scope.clone()),
            )
            .await?;

        info!(
            token_id = %claims.token_id,
            agent_id = %claims.agent_id,
            scope = %claims.scope,
            "consent token issued"
        );

        Ok(IssuedToken { token, claims })
    }

    /// Validate a presented token, optionally against a requested scope.
    ///
    /// Checks run in fixed order: structure and signature (any failure is the
    /// generic `TOKEN_INVALID`), then expiry, then revocation, then scope.
    /// With no asserted scope the first three checks still run and the scope
    /// check is skipped. Every validation, successful or not, is appended to
    /// the ledger.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Denied`] with the applicable [`DenyReason`] — the
    ///   normal rejection path, not an internal fault.
    /// - [`TokenError::Ledger`] / [`TokenError::Storage`] on infrastructure
    ///   failure; the token is treated as not validated.
    pub async fn validate(
        &self,
        token: &str,
        requested_scope: Option<&Scope>,
    ) -> Result<ConsentClaims, TokenError> {
        let Some(claims) = self.decode_and_verify(token) else {
            return self
                .deny(None, requested_scope, DenyReason::TokenInvalid)
                .await;
        };

        if Utc::now() >= claims.expires_at {
            return self
                .deny(Some(&claims), requested_scope, DenyReason::TokenExpired)
                .await;
        }

        if self.is_revoked(&claims.token_id).await? {
            return self
                .deny(Some(&claims), requested_scope, DenyReason::TokenRevoked)
                .await;
        }

        if let Some(requested) = requested_scope {
            if !claims.scope.satisfies(requested) {
                return self
                    .deny(Some(&claims), requested_scope, DenyReason::ScopeMismatch)
                    .await;
            }
        }

        // Ledger the asserted scope, or the token's own scope when none was.
        let ledgered_scope = requested_scope.unwrap_or(&claims.scope).clone();
        self.ledger
            .append(
                &LedgerEvent::new(LedgerAction::Validate, &claims.user_id)
                    .agent(&claims.agent_id)
                    .token(&claims.token_id)
                    .scope(ledgered_scope),
            )
            .await?;

        debug!(token_id = %claims.token_id, "consent token validated");
        Ok(claims)
    }

    /// Revoke a token by id.
    ///
    /// Idempotent and enumeration-safe: revoking an unknown or
    /// already-revoked id succeeds identically to revoking a live one.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Ledger`] or [`TokenError::Storage`] on
    /// infrastructure failure only.
    pub async fn revoke(&self, token_id: &str) -> Result<(), TokenError> {
        let mut event = LedgerEvent::new(LedgerAction::Revoke, "unknown").token(token_id);

        if let Some(mut record) = self.get_record(token_id).await? {
            event.user_id.clone_from(&record.user_id);
            event = event.agent(&record.agent_id).scope(record.scope.clone());
            if record.revoked_at.is_none() {
                record.revoked_at = Some(Utc::now());
                self.put_record(&record).await?;
            } else {
                event = event.detail("already revoked");
            }
        } else {
            event = event.detail("no record for token id");
        }

        self.ledger.append(&event).await?;
        info!(token_id, "consent token revoked");
        Ok(())
    }

    /// Revoke a token on behalf of `acting_user`.
    ///
    /// Responds identically whether the id is unknown, already revoked, or
    /// owned by someone else; only a token actually owned by `acting_user`
    /// changes state. The mismatch attempt is still ledgered.
    ///
    /// # Errors
    ///
    /// Same as [`revoke`](Self::revoke).
    pub async fn revoke_owned(&self, acting_user: &str, token_id: &str) -> Result<(), TokenError> {
        match self.get_record(token_id).await? {
            Some(record) if record.user_id != acting_user => {
                self.ledger
                    .append(
                        &LedgerEvent::new(LedgerAction::Revoke, acting_user)
                            .token(token_id)
                            .outcome("USER_MISMATCH")
                            .detail("revoke attempted by non-owner"),
                    )
                    .await?;
                Ok(())
            }
            _ => self.revoke(token_id).await,
        }
    }

    /// Whether a token id has been revoked. A missing record counts as not
    /// revoked — the signature, not the record, is what makes a token real.
    async fn is_revoked(&self, token_id: &str) -> Result<bool, TokenError> {
        Ok(self
            .get_record(token_id)
            .await?
            .is_some_and(|r| r.revoked_at.is_some()))
    }

    /// Decode the wire form and verify the signature. Returns `None` on any
    /// structural or signature failure — callers must not distinguish why.
    fn decode_and_verify(&self, token: &str) -> Option<ConsentClaims> {
        let rest = token.strip_prefix(TOKEN_PREFIX)?;
        let (payload_b64, sig_hex) = rest.rsplit_once('.')?;
        let payload = BASE64.decode(payload_b64).ok()?;
        let signature = hex::decode(sig_hex).ok()?;

        if !crypto::verify(&self.signing_key, &payload, &signature) {
            return None;
        }

        serde_json::from_slice(&payload).ok()
    }

    async fn deny(
        &self,
        claims: Option<&ConsentClaims>,
        requested_scope: Option<&Scope>,
        reason: DenyReason,
    ) -> Result<ConsentClaims, TokenError> {
        let mut event = LedgerEvent::new(
            LedgerAction::Validate,
            claims.map_or("unknown", |c| c.user_id.as_str()),
        )
        .outcome(reason.code());
        if let Some(requested) = requested_scope {
            event = event.scope(requested.clone());
        }
        if let Some(claims) = claims {
            event = event.agent(&claims.agent_id).token(&claims.token_id);
        }
        self.ledger.append(&event).await?;

        debug!(reason = %reason, "consent token denied");
        Err(TokenError::Denied(reason))
    }

    async fn get_record(&self, token_id: &str) -> Result<Option<TokenRecord>, TokenError> {
        let key = format!("{RECORD_PREFIX}{token_id}");
        match self.storage.get(&key).await? {
            Some(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|e| TokenError::Serialization {
                        reason: format!("corrupt token record '{token_id}': {e}"),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put_record(&self, record: &TokenRecord) -> Result<(), TokenError> {
        let key = format!("{RECORD_PREFIX}{}", record.token_id);
        let bytes = serde_json::to_vec(record).map_err(|e| TokenError::Serialization {
            reason: e.to_string(),
        })?;
        self.storage.put(&key, &bytes).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ConsentTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentTokenService").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::StorageLedgerBackend;
    use hushvault_storage::MemoryBackend;

    const TEST_KEY: [u8; 32] = [0x42; 32];

    fn scope(raw: &str) -> Scope {
        Scope::parse(raw).unwrap()
    }

    async fn service() -> (ConsentTokenService, Arc<StorageLedgerBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let ledger_backend = Arc::new(StorageLedgerBackend::new(Arc::clone(&storage)));
        let ledger = Arc::new(ConsentLedger::new());
        ledger
            .add_backend(Arc::clone(&ledger_backend) as Arc<dyn crate::ledger::LedgerBackend>)
            .await;
        (
            ConsentTokenService::new(SigningKey::from_bytes(TEST_KEY), storage, ledger),
            ledger_backend,
        )
    }

    /// Build a wire token directly, bypassing `issue`. Used to craft expired
    /// or otherwise unusual claims that `issue` refuses to produce.
    fn forge_token(claims: &ConsentClaims, key: &SigningKey) -> String {
        let payload = serde_json::to_vec(claims).unwrap();
        let sig = crypto::sign(key, &payload);
        format!("{TOKEN_PREFIX}{}.{}", BASE64.encode(&payload), hex::encode(sig))
    }

    fn expired_claims() -> ConsentClaims {
        ConsentClaims {
            token_id: "tok-expired".to_owned(),
            user_id: "user-1".to_owned(),
            agent_id: "kai".to_owned(),
            scope: scope("vault.write.food"),
            issued_at: Utc::now() - Duration::hours(2),
            expires_at: Utc::now() - Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn issue_then_validate_roundtrip() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.write.food"), Duration::hours(1))
            .await
            .unwrap();

        assert!(issued.token.starts_with(TOKEN_PREFIX));
        assert_eq!(issued.token.matches('.').count(), 1);

        let claims = svc
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await
            .unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.agent_id, "kai");
    }

    #[tokio::test]
    async fn zero_or_negative_ttl_rejected() {
        let (svc, _) = service().await;
        for ttl in [Duration::zero(), Duration::seconds(-5)] {
            let result = svc.issue("user-1", "kai", scope("vault.read.food"), ttl).await;
            assert!(matches!(result, Err(TokenError::InvalidTtl { .. })));
        }
    }

    #[tokio::test]
    async fn tampered_payload_is_generic_token_invalid() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        // Swap one payload character. Signature no longer matches.
        let rest = issued.token.strip_prefix(TOKEN_PREFIX).unwrap();
        let (payload, sig) = rest.rsplit_once('.').unwrap();
        let mut chars: Vec<char> = payload.chars().collect();
        chars[10] = if chars[10] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        let token = format!("{TOKEN_PREFIX}{tampered}.{sig}");

        let result = svc.validate(&token, Some(&scope("vault.read.food"))).await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenInvalid))
        ));
    }

    #[tokio::test]
    async fn structural_garbage_is_generic_token_invalid() {
        let (svc, _) = service().await;
        for token in [
            "",
            "HCT:",
            "not-a-token",
            "HCT:missing-separator",
            "HCT:!!!.deadbeef",
            "HCT:aGVsbG8=.not-hex",
        ] {
            let result = svc.validate(token, Some(&scope("vault.read.food"))).await;
            assert!(
                matches!(result, Err(TokenError::Denied(DenyReason::TokenInvalid))),
                "token {token:?} should be TOKEN_INVALID"
            );
        }
    }

    #[tokio::test]
    async fn foreign_key_signature_rejected() {
        let (svc, _) = service().await;
        let claims = ConsentClaims {
            token_id: "tok-forged".to_owned(),
            user_id: "user-1".to_owned(),
            agent_id: "kai".to_owned(),
            scope: scope("vault.read.food"),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let token = forge_token(&claims, &SigningKey::from_bytes([0x99; 32]));

        let result = svc.validate(&token, Some(&scope("vault.read.food"))).await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenInvalid))
        ));
    }

    #[tokio::test]
    async fn expired_token_denied() {
        let (svc, _) = service().await;
        let token = forge_token(&expired_claims(), &SigningKey::from_bytes(TEST_KEY));

        let result = svc.validate(&token, Some(&scope("vault.write.food"))).await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenExpired))
        ));
    }

    #[tokio::test]
    async fn expiry_checked_before_revocation_and_scope() {
        let (svc, _) = service().await;
        // Expired, revoked, and scope-mismatched at once: expiry wins.
        let claims = expired_claims();
        let token = forge_token(&claims, &SigningKey::from_bytes(TEST_KEY));
        svc.revoke(&claims.token_id).await.unwrap();

        let result = svc.validate(&token, Some(&scope("payments.send"))).await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenExpired))
        ));
    }

    #[tokio::test]
    async fn revoked_token_denied() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.write.food"), Duration::hours(1))
            .await
            .unwrap();
        svc.revoke(&issued.claims.token_id).await.unwrap();

        let result = svc
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenRevoked))
        ));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_for_unknown_and_repeated_ids() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        svc.revoke(&issued.claims.token_id).await.unwrap();
        svc.revoke(&issued.claims.token_id).await.unwrap();
        svc.revoke("no-such-token-id").await.unwrap();
    }

    #[tokio::test]
    async fn revoke_owned_ignores_foreign_tokens() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        // A stranger's revoke succeeds outwardly but changes nothing.
        svc.revoke_owned("user-2", &issued.claims.token_id).await.unwrap();
        svc.validate(&issued.token, Some(&scope("vault.read.food")))
            .await
            .unwrap();

        // The owner's revoke sticks.
        svc.revoke_owned("user-1", &issued.claims.token_id).await.unwrap();
        let result = svc
            .validate(&issued.token, Some(&scope("vault.read.food")))
            .await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenRevoked))
        ));
    }

    #[tokio::test]
    async fn scope_mismatch_denied() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        let result = svc
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::ScopeMismatch))
        ));
    }

    #[tokio::test]
    async fn wildcard_grant_satisfies_narrower_request() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.*"), Duration::hours(1))
            .await
            .unwrap();

        svc.validate(&issued.token, Some(&scope("vault.read.food")))
            .await
            .unwrap();
        let result = svc
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::ScopeMismatch))
        ));
    }

    #[tokio::test]
    async fn validate_without_asserted_scope_skips_only_the_scope_check() {
        let (svc, _) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        let claims = svc.validate(&issued.token, None).await.unwrap();
        assert_eq!(claims, issued.claims);

        // Revocation still applies when no scope is asserted.
        svc.revoke(&issued.claims.token_id).await.unwrap();
        let result = svc.validate(&issued.token, None).await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenRevoked))
        ));
    }

    #[tokio::test]
    async fn expired_and_garbage_tokens_denied_without_asserted_scope() {
        let (svc, _) = service().await;

        let expired = forge_token(&expired_claims(), &SigningKey::from_bytes(TEST_KEY));
        assert!(matches!(
            svc.validate(&expired, None).await,
            Err(TokenError::Denied(DenyReason::TokenExpired))
        ));
        assert!(matches!(
            svc.validate("HCT:garbage", None).await,
            Err(TokenError::Denied(DenyReason::TokenInvalid))
        ));
    }

    #[tokio::test]
    async fn every_validation_is_ledgered_with_outcome() {
        let (svc, ledger) = service().await;
        let issued = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await
            .unwrap();

        svc.validate(&issued.token, Some(&scope("vault.read.food")))
            .await
            .unwrap();
        let _ = svc
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await;

        let events = ledger.query_token(&issued.claims.token_id).await.unwrap();
        let outcomes: Vec<(&LedgerAction, &str)> = events
            .iter()
            .map(|e| (&e.action, e.outcome.as_str()))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (&LedgerAction::Issue, "ok"),
                (&LedgerAction::Validate, "ok"),
                (&LedgerAction::Validate, "SCOPE_MISMATCH"),
            ]
        );
    }

    #[tokio::test]
    async fn ledger_outage_fails_closed() {
        struct FailingBackend;

        #[async_trait::async_trait]
        impl crate::ledger::LedgerBackend for FailingBackend {
            fn name(&self) -> &str {
                "failing"
            }
            async fn append(
                &self,
                _event: &LedgerEvent,
            ) -> Result<(), crate::error::LedgerError> {
                Err(crate::error::LedgerError::BackendFailure {
                    name: "failing".to_owned(),
                    reason: "down".to_owned(),
                })
            }
        }

        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let ledger = Arc::new(ConsentLedger::new());
        ledger.add_backend(Arc::new(FailingBackend)).await;
        let svc = ConsentTokenService::new(SigningKey::from_bytes(TEST_KEY), storage, ledger);

        let result = svc
            .issue("user-1", "kai", scope("vault.read.food"), Duration::hours(1))
            .await;
        assert!(matches!(result, Err(TokenError::Ledger(_))));
    }
}
