//! Pending-consent workflow.
//!
//! When an agent needs a capability the owner has not yet granted, it files a
//! pending request and waits for the owner's decision. The request moves
//! through a small state machine:
//!
//! ```text
//! REQUESTED ──approve──▶ CONSENT_GRANTED ──revoke──▶ REVOKED
//!     │
//!     ├──deny──────────▶ CONSENT_DENIED
//!     └──timeout───────▶ TIMEOUT
//! ```
//!
//! `CONSENT_DENIED`, `TIMEOUT`, and `REVOKED` are terminal. Transitions are
//! first-writer-wins: a conditional check-and-set under a store-level mutex,
//! so a grant and a timeout racing on the same request resolve to exactly one
//! winner and the loser observes `InvalidTransition` with no state change.
//! Approval synchronously issues a consent token, so a granted request always
//! has its token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use hushvault_storage::StorageBackend;

use crate::consent::{ConsentTokenService, IssuedToken};
use crate::error::WorkflowError;
use crate::ledger::{ConsentLedger, LedgerAction, LedgerEvent};
use crate::scope::Scope;

/// Storage prefix for pending-request records.
const RECORD_PREFIX: &str = "consent/requests/";

/// Lifecycle status of a consent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Awaiting the owner's decision.
    Requested,
    /// Granted; a consent token was issued.
    ConsentGranted,
    /// Denied by the owner. Terminal.
    ConsentDenied,
    /// No decision arrived within the wait window. Terminal.
    Timeout,
    /// Granted, then the issued token was revoked. Terminal.
    Revoked,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::ConsentGranted => "CONSENT_GRANTED",
            Self::ConsentDenied => "CONSENT_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

/// A consent request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Unique request id.
    pub request_id: String,
    /// The data owner whose decision is awaited.
    pub user_id: String,
    /// The agent asking for the capability.
    pub agent_id: String,
    /// The capability being asked for.
    pub scope: Scope,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// When the request was filed.
    pub created_at: DateTime<Utc>,
    /// When a terminal or granted status was reached.
    pub decided_at: Option<DateTime<Utc>>,
    /// The token issued on grant, if any.
    pub token_id: Option<String>,
}

/// A notification emitted on every workflow transition.
///
/// Delivery is at-least-once; consumers key idempotency on
/// `(request_id, action)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEvent {
    /// The request this event concerns.
    pub request_id: String,
    /// The owner whose channel this event belongs on.
    pub user_id: String,
    /// The requesting agent.
    pub agent_id: String,
    /// What happened: `request`, `grant`, `deny`, `timeout`, or `revoke`.
    pub action: LedgerAction,
    /// The scope involved.
    pub scope: Scope,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// Delivery seam for [`ConsentEvent`]s. The server hangs its per-user
/// broadcast hub here; tests hang a collector.
pub trait ConsentNotifier: Send + Sync {
    /// Deliver one event. Must not block; dropping an event is acceptable
    /// (consumers reconcile via the ledger).
    fn notify(&self, event: ConsentEvent);
}

/// Notifier that discards events. Useful when no consumer is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl ConsentNotifier for NullNotifier {
    fn notify(&self, _event: ConsentEvent) {}
}

/// The pending-consent state machine over the storage backend.
pub struct ConsentWorkflow {
    storage: Arc<dyn StorageBackend>,
    tokens: Arc<ConsentTokenService>,
    ledger: Arc<ConsentLedger>,
    notifier: Arc<dyn ConsentNotifier>,
    /// TTL of tokens issued on grant.
    grant_ttl: Duration,
    /// Serializes transitions so check-and-set is race-free.
    transition_lock: Mutex<()>,
    #[cfg(feature = "dev-auto-grant")]
    auto_grant: bool,
}

impl ConsentWorkflow {
    /// Create a workflow. Tokens issued on grant are valid for `grant_ttl`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        tokens: Arc<ConsentTokenService>,
        ledger: Arc<ConsentLedger>,
        notifier: Arc<dyn ConsentNotifier>,
        grant_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            tokens,
            ledger,
            notifier,
            grant_ttl,
            transition_lock: Mutex::new(()),
            #[cfg(feature = "dev-auto-grant")]
            auto_grant: false,
        }
    }

    /// Grant every request at submit time instead of waiting for the owner.
    /// Compiled in only with the `dev-auto-grant` feature.
    #[cfg(feature = "dev-auto-grant")]
    pub fn enable_auto_grant(&mut self) {
        self.auto_grant = true;
    }

    /// File a new consent request in status `REQUESTED`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Ledger`] or [`WorkflowError::Storage`] on
    /// infrastructure failure.
    pub async fn submit(
        &self,
        user_id: &str,
        agent_id: &str,
        scope: Scope,
    ) -> Result<PendingRequest, WorkflowError> {
        let request = PendingRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            agent_id: agent_id.to_owned(),
            scope,
            status: RequestStatus::Requested,
            created_at: Utc::now(),
            decided_at: None,
            token_id: None,
        };
        self.put_record(&request).await?;

        self.ledger
            .append(
                &LedgerEvent::new(LedgerAction::Request, user_id)
                    .agent(agent_id)
                    .request(&request.request_id)
                    .scope(request.scope.clone()),
            )
            .await?;
        self.emit(&request, LedgerAction::Request);

        info!(
            request_id = %request.request_id,
            agent_id,
            scope = %request.scope,
            "consent request filed"
        );

        #[cfg(feature = "dev-auto-grant")]
        if self.auto_grant {
            let (granted, _token) = self.approve(user_id, &request.request_id).await?;
            return Ok(granted);
        }

        Ok(request)
    }

    /// Approve a request as its owner: `REQUESTED -> CONSENT_GRANTED`, then
    /// issue the consent token.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown request id.
    /// - [`WorkflowError::UserMismatch`] if `acting_user` does not own the
    ///   request.
    /// - [`WorkflowError::InvalidTransition`] if another decision landed
    ///   first. No state was changed.
    /// - [`WorkflowError::Issuance`] if the token could not be issued; the
    ///   request stays `REQUESTED` so the owner can retry.
    pub async fn approve(
        &self,
        acting_user: &str,
        request_id: &str,
    ) -> Result<(PendingRequest, IssuedToken), WorkflowError> {
        let _guard = self.transition_lock.lock().await;

        let mut request = self.load_owned(acting_user, request_id).await?;
        self.check_transition(&request, RequestStatus::Requested, RequestStatus::ConsentGranted)
            .await?;

        // Issue before persisting the status flip so a granted request always
        // carries its token.
        let issued = self
            .tokens
            .issue(
                &request.user_id,
                &request.agent_id,
                request.scope.clone(),
                self.grant_ttl,
            )
            .await?;

        request.status = RequestStatus::ConsentGranted;
        request.decided_at = Some(Utc::now());
        request.token_id = Some(issued.claims.token_id.clone());
        self.put_record(&request).await?;

        self.ledger
            .append(
                &LedgerEvent::new(LedgerAction::Grant, &request.user_id)
                    .agent(&request.agent_id)
                    .request(request_id)
                    .token(&issued.claims.token_id)
                    .scope(request.scope.clone()),
            )
            .await?;
        self.emit(&request, LedgerAction::Grant);

        info!(request_id, token_id = %issued.claims.token_id, "consent granted");
        Ok((request, issued))
    }

    /// Deny a request as its owner: `REQUESTED -> CONSENT_DENIED`.
    ///
    /// # Errors
    ///
    /// Same guards as [`approve`](Self::approve), minus issuance.
    pub async fn deny(
        &self,
        acting_user: &str,
        request_id: &str,
    ) -> Result<PendingRequest, WorkflowError> {
        let _guard = self.transition_lock.lock().await;

        let mut request = self.load_owned(acting_user, request_id).await?;
        self.check_transition(&request, RequestStatus::Requested, RequestStatus::ConsentDenied)
            .await?;

        request.status = RequestStatus::ConsentDenied;
        request.decided_at = Some(Utc::now());
        self.put_record(&request).await?;

        self.ledger
            .append(
                &LedgerEvent::new(LedgerAction::Deny, &request.user_id)
                    .agent(&request.agent_id)
                    .request(request_id)
                    .scope(request.scope.clone()),
            )
            .await?;
        self.emit(&request, LedgerAction::Deny);

        info!(request_id, "consent denied");
        Ok(request)
    }

    /// Sweep all requests still `REQUESTED` after `max_wait` into `TIMEOUT`.
    /// Returns how many were expired.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Storage`] or [`WorkflowError::Ledger`] on
    /// infrastructure failure; requests already swept stay swept.
    pub async fn expire_overdue(&self, max_wait: Duration) -> Result<usize, WorkflowError> {
        let _guard = self.transition_lock.lock().await;

        let cutoff = Utc::now() - max_wait;
        let mut expired = 0usize;

        for key in self.storage.list(RECORD_PREFIX).await? {
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            let mut request: PendingRequest =
                serde_json::from_slice(&bytes).map_err(|e| WorkflowError::Serialization {
                    reason: format!("corrupt request record at '{key}': {e}"),
                })?;

            if request.status != RequestStatus::Requested || request.created_at > cutoff {
                continue;
            }

            request.status = RequestStatus::Timeout;
            request.decided_at = Some(Utc::now());
            self.put_record(&request).await?;

            self.ledger
                .append(
                    &LedgerEvent::new(LedgerAction::Timeout, &request.user_id)
                        .agent(&request.agent_id)
                        .request(&request.request_id)
                        .scope(request.scope.clone()),
                )
                .await?;
            self.emit(&request, LedgerAction::Timeout);

            debug!(request_id = %request.request_id, "consent request timed out");
            expired = expired.saturating_add(1);
        }

        Ok(expired)
    }

    /// Mark a granted request `REVOKED` after its token was revoked:
    /// `CONSENT_GRANTED -> REVOKED`. Also revokes the issued token, so
    /// callers need only this one call.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown request id.
    /// - [`WorkflowError::InvalidTransition`] unless the request is
    ///   currently `CONSENT_GRANTED`.
    pub async fn revoke_granted(&self, request_id: &str) -> Result<PendingRequest, WorkflowError> {
        let _guard = self.transition_lock.lock().await;

        let mut request = self.load(request_id).await?;
        self.check_transition(&request, RequestStatus::ConsentGranted, RequestStatus::Revoked)
            .await?;

        if let Some(ref token_id) = request.token_id {
            self.tokens.revoke(token_id).await?;
        }

        request.status = RequestStatus::Revoked;
        request.decided_at = Some(Utc::now());
        self.put_record(&request).await?;
        self.emit(&request, LedgerAction::Revoke);

        info!(request_id, "granted consent revoked");
        Ok(request)
    }

    /// Fetch a request by id.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::NotFound`] if it does not exist.
    pub async fn get(&self, request_id: &str) -> Result<PendingRequest, WorkflowError> {
        self.load(request_id).await
    }

    /// All requests for a user still awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Storage`] on backend failure.
    pub async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingRequest>, WorkflowError> {
        let mut pending = Vec::new();
        for key in self.storage.list(RECORD_PREFIX).await? {
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            let request: PendingRequest =
                serde_json::from_slice(&bytes).map_err(|e| WorkflowError::Serialization {
                    reason: format!("corrupt request record at '{key}': {e}"),
                })?;
            if request.user_id == user_id && request.status == RequestStatus::Requested {
                pending.push(request);
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    /// Guard a transition; on refusal, ledger the attempt and fail with no
    /// state change.
    async fn check_transition(
        &self,
        request: &PendingRequest,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<(), WorkflowError> {
        if request.status == from {
            return Ok(());
        }

        self.ledger
            .append(
                &LedgerEvent::new(action_for(to), &request.user_id)
                    .agent(&request.agent_id)
                    .request(&request.request_id)
                    .scope(request.scope.clone())
                    .outcome("INVALID_TRANSITION")
                    .detail(format!("{} -> {to}", request.status)),
            )
            .await?;

        Err(WorkflowError::InvalidTransition {
            request_id: request.request_id.clone(),
            from: request.status.to_string(),
            to: to.to_string(),
        })
    }

    async fn load_owned(
        &self,
        acting_user: &str,
        request_id: &str,
    ) -> Result<PendingRequest, WorkflowError> {
        let request = self.load(request_id).await?;
        if request.user_id != acting_user {
            self.ledger
                .append(
                    &LedgerEvent::new(LedgerAction::Validate, acting_user)
                        .request(request_id)
                        .outcome("USER_MISMATCH")
                        .detail("decision attempted by non-owner"),
                )
                .await?;
            return Err(WorkflowError::UserMismatch {
                request_id: request_id.to_owned(),
            });
        }
        Ok(request)
    }

    async fn load(&self, request_id: &str) -> Result<PendingRequest, WorkflowError> {
        let key = format!("{RECORD_PREFIX}{request_id}");
        let bytes = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                request_id: request_id.to_owned(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| WorkflowError::Serialization {
            reason: format!("corrupt request record '{request_id}': {e}"),
        })
    }

    async fn put_record(&self, request: &PendingRequest) -> Result<(), WorkflowError> {
        let key = format!("{RECORD_PREFIX}{}", request.request_id);
        let bytes = serde_json::to_vec(request).map_err(|e| WorkflowError::Serialization {
            reason: e.to_string(),
        })?;
        self.storage.put(&key, &bytes).await?;
        Ok(())
    }

    fn emit(&self, request: &PendingRequest, action: LedgerAction) {
        self.notifier.notify(ConsentEvent {
            request_id: request.request_id.clone(),
            user_id: request.user_id.clone(),
            agent_id: request.agent_id.clone(),
            action,
            scope: request.scope.clone(),
            timestamp: Utc::now(),
        });
    }
}

impl std::fmt::Debug for ConsentWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentWorkflow")
            .field("grant_ttl", &self.grant_ttl)
            .finish_non_exhaustive()
    }
}

fn action_for(to: RequestStatus) -> LedgerAction {
    match to {
        RequestStatus::Requested => LedgerAction::Request,
        RequestStatus::ConsentGranted => LedgerAction::Grant,
        RequestStatus::ConsentDenied => LedgerAction::Deny,
        RequestStatus::Timeout => LedgerAction::Timeout,
        RequestStatus::Revoked => LedgerAction::Revoke,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::SigningKey;
    use crate::error::{DenyReason, TokenError};
    use crate::ledger::StorageLedgerBackend;
    use hushvault_storage::MemoryBackend;
    use std::sync::Mutex as StdMutex;

    /// Collects every emitted event for assertions.
    #[derive(Default)]
    struct Collector {
        events: StdMutex<Vec<ConsentEvent>>,
    }

    impl ConsentNotifier for Collector {
        fn notify(&self, event: ConsentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Collector {
        fn actions(&self) -> Vec<LedgerAction> {
            self.events.lock().unwrap().iter().map(|e| e.action).collect()
        }
    }

    struct Fixture {
        workflow: ConsentWorkflow,
        tokens: Arc<ConsentTokenService>,
        collector: Arc<Collector>,
        ledger_backend: Arc<StorageLedgerBackend>,
    }

    fn scope(raw: &str) -> Scope {
        Scope::parse(raw).unwrap()
    }

    async fn fixture() -> Fixture {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let ledger_backend = Arc::new(StorageLedgerBackend::new(Arc::clone(&storage)));
        let ledger = Arc::new(ConsentLedger::new());
        ledger
            .add_backend(
                Arc::clone(&ledger_backend) as Arc<dyn crate::ledger::LedgerBackend>
            )
            .await;
        let tokens = Arc::new(ConsentTokenService::new(
            SigningKey::from_bytes([0x11; 32]),
            Arc::clone(&storage),
            Arc::clone(&ledger),
        ));
        let collector = Arc::new(Collector::default());
        let workflow = ConsentWorkflow::new(
            storage,
            Arc::clone(&tokens),
            ledger,
            Arc::clone(&collector) as Arc<dyn ConsentNotifier>,
            Duration::hours(1),
        );
        Fixture {
            workflow,
            tokens,
            collector,
            ledger_backend,
        }
    }

    #[tokio::test]
    async fn submit_creates_requested_entry() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();

        assert_eq!(request.status, RequestStatus::Requested);
        assert!(request.token_id.is_none());
        assert_eq!(fx.collector.actions(), vec![LedgerAction::Request]);

        let pending = fx.workflow.list_pending("user-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, request.request_id);
    }

    #[tokio::test]
    async fn approve_grants_and_issues_token() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();

        let (granted, issued) = fx
            .workflow
            .approve("user-1", &request.request_id)
            .await
            .unwrap();

        assert_eq!(granted.status, RequestStatus::ConsentGranted);
        assert_eq!(granted.token_id.as_deref(), Some(issued.claims.token_id.as_str()));
        assert_eq!(issued.claims.agent_id, "kai");

        // The issued token is immediately usable.
        fx.tokens
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await
            .unwrap();

        assert_eq!(
            fx.collector.actions(),
            vec![LedgerAction::Request, LedgerAction::Grant]
        );
    }

    #[tokio::test]
    async fn deny_is_terminal() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.read.food"))
            .await
            .unwrap();

        let denied = fx.workflow.deny("user-1", &request.request_id).await.unwrap();
        assert_eq!(denied.status, RequestStatus::ConsentDenied);

        let result = fx.workflow.approve("user-1", &request.request_id).await;
        assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn decisions_are_exclusive_first_writer_wins() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();

        fx.workflow.approve("user-1", &request.request_id).await.unwrap();

        let deny = fx.workflow.deny("user-1", &request.request_id).await;
        assert!(matches!(deny, Err(WorkflowError::InvalidTransition { .. })));

        // The losing attempt left the winning state intact and was ledgered.
        let current = fx.workflow.get(&request.request_id).await.unwrap();
        assert_eq!(current.status, RequestStatus::ConsentGranted);

        let events = fx.ledger_backend.query_user("user-1").await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.outcome == "INVALID_TRANSITION" && e.action == LedgerAction::Deny));
    }

    #[tokio::test]
    async fn only_the_owner_decides() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.read.food"))
            .await
            .unwrap();

        let result = fx.workflow.approve("user-2", &request.request_id).await;
        assert!(matches!(result, Err(WorkflowError::UserMismatch { .. })));

        // Untouched by the stranger's attempt.
        let current = fx.workflow.get(&request.request_id).await.unwrap();
        assert_eq!(current.status, RequestStatus::Requested);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let fx = fixture().await;
        let result = fx.workflow.approve("user-1", "no-such-request").await;
        assert!(matches!(result, Err(WorkflowError::NotFound { .. })));
    }

    #[tokio::test]
    async fn overdue_requests_time_out() {
        let fx = fixture().await;
        let old = fx
            .workflow
            .submit("user-1", "kai", scope("vault.read.food"))
            .await
            .unwrap();
        fx.workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();

        // Sweeping with zero wait expires everything REQUESTED.
        let expired = fx.workflow.expire_overdue(Duration::zero()).await.unwrap();
        assert_eq!(expired, 2);

        let current = fx.workflow.get(&old.request_id).await.unwrap();
        assert_eq!(current.status, RequestStatus::Timeout);

        // A decision after timeout loses.
        let result = fx.workflow.approve("user-1", &old.request_id).await;
        assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn sweep_skips_fresh_and_decided_requests() {
        let fx = fixture().await;
        let fresh = fx
            .workflow
            .submit("user-1", "kai", scope("vault.read.food"))
            .await
            .unwrap();
        let decided = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();
        fx.workflow.deny("user-1", &decided.request_id).await.unwrap();

        let expired = fx.workflow.expire_overdue(Duration::hours(1)).await.unwrap();
        assert_eq!(expired, 0);
        assert_eq!(
            fx.workflow.get(&fresh.request_id).await.unwrap().status,
            RequestStatus::Requested
        );
    }

    #[tokio::test]
    async fn revoke_granted_revokes_the_token_too() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();
        let (_, issued) = fx.workflow.approve("user-1", &request.request_id).await.unwrap();

        let revoked = fx.workflow.revoke_granted(&request.request_id).await.unwrap();
        assert_eq!(revoked.status, RequestStatus::Revoked);

        let result = fx
            .tokens
            .validate(&issued.token, Some(&scope("vault.write.food")))
            .await;
        assert!(matches!(
            result,
            Err(TokenError::Denied(DenyReason::TokenRevoked))
        ));
    }

    #[tokio::test]
    async fn revoke_requires_granted_state() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.read.food"))
            .await
            .unwrap();

        let result = fx.workflow.revoke_granted(&request.request_id).await;
        assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn events_carry_idempotency_keys() {
        let fx = fixture().await;
        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();
        fx.workflow.approve("user-1", &request.request_id).await.unwrap();

        let events = fx.collector.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.request_id == request.request_id));
        assert_eq!(events[0].action, LedgerAction::Request);
        assert_eq!(events[1].action, LedgerAction::Grant);
    }

    #[cfg(feature = "dev-auto-grant")]
    #[tokio::test]
    async fn auto_grant_decides_at_submit() {
        let mut fx = fixture().await;
        fx.workflow.enable_auto_grant();

        let request = fx
            .workflow
            .submit("user-1", "kai", scope("vault.write.food"))
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::ConsentGranted);
        assert!(request.token_id.is_some());
    }
}
