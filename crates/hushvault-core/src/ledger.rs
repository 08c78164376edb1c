//! Append-only consent ledger.
//!
//! Every token lifecycle event (issue, validate, revoke) and every workflow
//! transition (request, grant, deny, timeout) is appended here BEFORE the
//! operation's result is returned. If all ledger backends fail to write, the
//! gated operation is denied (fail-closed).
//!
//! Entries record token and request identifiers verbatim — those are not
//! bearer material (the HMAC signature is what makes a consent token
//! spendable, and session tokens never reach this module).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use hushvault_storage::StorageBackend;

use crate::error::LedgerError;
use crate::scope::Scope;

/// Storage prefix for the per-user event index.
const USER_INDEX_PREFIX: &str = "ledger/user/";

/// Storage prefix for the per-token event index.
const TOKEN_INDEX_PREFIX: &str = "ledger/token/";

/// The action a ledger event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    /// A consent token was issued.
    Issue,
    /// A consent token was presented for validation (outcome included).
    Validate,
    /// A consent token was revoked.
    Revoke,
    /// A pending consent request was created.
    Request,
    /// A pending request was granted by its owner.
    Grant,
    /// A pending request was denied by its owner.
    Deny,
    /// A pending request timed out before a decision.
    Timeout,
}

/// One append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Unique event id.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub action: LedgerAction,
    /// The data owner this event concerns.
    pub user_id: String,
    /// The requesting agent, where one is involved.
    pub agent_id: Option<String>,
    /// Consent token id, for token lifecycle events.
    pub token_id: Option<String>,
    /// Pending request id, for workflow events.
    pub request_id: Option<String>,
    /// The scope involved.
    pub scope: Option<Scope>,
    /// Outcome: `ok` or a denial reason code.
    pub outcome: String,
    /// Free-form detail for forensics (e.g. the rejected transition).
    pub detail: Option<String>,
}

impl LedgerEvent {
    /// Start a new event for the given action and user with outcome `ok`.
    #[must_use]
    pub fn new(action: LedgerAction, user_id: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            user_id: user_id.into(),
            agent_id: None,
            token_id: None,
            request_id: None,
            scope: None,
            outcome: "ok".to_owned(),
            detail: None,
        }
    }

    /// Attach the requesting agent.
    #[must_use]
    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach the consent token id.
    #[must_use]
    pub fn token(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    /// Attach the pending request id.
    #[must_use]
    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the scope.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Record a non-`ok` outcome (a denial reason code).
    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    /// Attach forensic detail.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A sink for ledger events.
///
/// Implementations must never update or delete previously written entries.
#[async_trait::async_trait]
pub trait LedgerBackend: Send + Sync {
    /// The backend's name, for error reporting.
    fn name(&self) -> &str;

    /// Append one event. Must not silently drop entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn append(&self, event: &LedgerEvent) -> Result<(), LedgerError>;
}

/// Fans ledger events out to all registered backends, fail-closed.
///
/// If at least one backend persists the event the operation proceeds; if
/// every backend fails, [`LedgerError::AllBackendsFailed`] is returned and
/// the caller must deny the gated operation.
pub struct ConsentLedger {
    backends: RwLock<Vec<Arc<dyn LedgerBackend>>>,
}

impl ConsentLedger {
    /// Create an empty ledger manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend.
    pub async fn add_backend(&self, backend: Arc<dyn LedgerBackend>) {
        self.backends.write().await.push(backend);
    }

    /// Whether any backends are registered.
    pub async fn has_backends(&self) -> bool {
        !self.backends.read().await.is_empty()
    }

    /// Append an event to all backends.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AllBackendsFailed`] if every backend fails.
    /// With no backends registered the append is a no-op.
    pub async fn append(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        let backends = self.backends.read().await;

        if backends.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for backend in backends.iter() {
            match backend.append(event).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "ledger backend failed");
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(LedgerError::AllBackendsFailed)
        }
    }
}

impl Default for ConsentLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConsentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentLedger").finish_non_exhaustive()
    }
}

/// Ledger backend over the storage layer, indexed for queries.
///
/// Each event is written twice: under the user index (queryable by owner)
/// and, when a token id is present, under the token index (used by consent
/// token validation to detect revocation history and by audit reviews).
/// Keys embed a zero-padded millisecond timestamp so prefix listing returns
/// events in order.
pub struct StorageLedgerBackend {
    storage: Arc<dyn StorageBackend>,
    /// Breaks timestamp ties so same-millisecond events keep append order.
    sequence: std::sync::atomic::AtomicU64,
}

impl StorageLedgerBackend {
    /// Create a backend over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn index_key(&self, prefix: &str, id: &str, event: &LedgerEvent, seq: u64) -> String {
        format!(
            "{prefix}{id}/{:020}-{seq:012}-{}",
            event.timestamp.timestamp_millis().max(0),
            event.event_id
        )
    }

    /// All events for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if listing or reading fails.
    pub async fn query_user(&self, user_id: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.query_prefix(&format!("{USER_INDEX_PREFIX}{user_id}/"))
            .await
    }

    /// All events for a consent token, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if listing or reading fails.
    pub async fn query_token(&self, token_id: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.query_prefix(&format!("{TOKEN_INDEX_PREFIX}{token_id}/"))
            .await
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        let keys = self.storage.list(prefix).await?;
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.storage.get(&key).await? {
                let event: LedgerEvent =
                    serde_json::from_slice(&bytes).map_err(|e| LedgerError::Serialization {
                        reason: format!("corrupt ledger entry at '{key}': {e}"),
                    })?;
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[async_trait::async_trait]
impl LedgerBackend for StorageLedgerBackend {
    fn name(&self) -> &str {
        "storage"
    }

    async fn append(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(event).map_err(|e| LedgerError::Serialization {
            reason: e.to_string(),
        })?;

        let seq = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let user_key = self.index_key(USER_INDEX_PREFIX, &event.user_id, event, seq);
        self.storage
            .put(&user_key, &bytes)
            .await
            .map_err(|e| LedgerError::BackendFailure {
                name: "storage".to_owned(),
                reason: e.to_string(),
            })?;

        if let Some(ref token_id) = event.token_id {
            let token_key = self.index_key(TOKEN_INDEX_PREFIX, token_id, event, seq);
            self.storage
                .put(&token_key, &bytes)
                .await
                .map_err(|e| LedgerError::BackendFailure {
                    name: "storage".to_owned(),
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for StorageLedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLedgerBackend").finish_non_exhaustive()
    }
}

/// Ledger backend that appends JSON-lines to a file.
///
/// Each line is one complete [`LedgerEvent`]. The file is opened in
/// append-only mode; no update or delete is ever performed. A `tokio::sync::
/// Mutex` serializes writes — the critical section is one `write_all`.
pub struct FileLedgerBackend {
    path: std::path::PathBuf,
    writer: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileLedgerBackend {
    /// Create a file backend writing to the given path. The file is opened
    /// lazily on first append.
    #[must_use]
    pub fn new(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    async fn get_writer(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<tokio::fs::File>>, LedgerError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| LedgerError::BackendFailure {
                    name: "file".to_owned(),
                    reason: format!("failed to open ledger file '{}': {e}", self.path.display()),
                })?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl LedgerBackend for FileLedgerBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_vec(event).map_err(|e| LedgerError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.get_writer().await?;
        let file = guard.as_mut().ok_or_else(|| LedgerError::BackendFailure {
            name: "file".to_owned(),
            reason: "file handle unexpectedly None after open".to_owned(),
        })?;

        file.write_all(&line)
            .await
            .map_err(|e| LedgerError::BackendFailure {
                name: "file".to_owned(),
                reason: format!("write failed: {e}"),
            })?;

        file.flush().await.map_err(|e| LedgerError::BackendFailure {
            name: "file".to_owned(),
            reason: format!("flush failed: {e}"),
        })?;

        Ok(())
    }
}

impl std::fmt::Debug for FileLedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedgerBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hushvault_storage::MemoryBackend;

    fn storage_ledger() -> (ConsentLedger, Arc<StorageLedgerBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let backend = Arc::new(StorageLedgerBackend::new(storage));
        let ledger = ConsentLedger::new();
        (ledger, backend)
    }

    #[tokio::test]
    async fn append_without_backends_is_noop() {
        let ledger = ConsentLedger::new();
        let event = LedgerEvent::new(LedgerAction::Issue, "user-1");
        ledger.append(&event).await.unwrap();
        assert!(!ledger.has_backends().await);
    }

    #[tokio::test]
    async fn events_are_queryable_by_user_in_order() {
        let (ledger, backend) = storage_ledger();
        ledger.add_backend(Arc::clone(&backend) as Arc<dyn LedgerBackend>).await;

        let scope = Scope::parse("vault.write.food").unwrap();
        ledger
            .append(
                &LedgerEvent::new(LedgerAction::Request, "user-1")
                    .agent("kai")
                    .request("req-1")
                    .scope(scope.clone()),
            )
            .await
            .unwrap();
        ledger
            .append(
                &LedgerEvent::new(LedgerAction::Grant, "user-1")
                    .agent("kai")
                    .request("req-1")
                    .scope(scope),
            )
            .await
            .unwrap();
        ledger
            .append(&LedgerEvent::new(LedgerAction::Request, "user-2").agent("kai"))
            .await
            .unwrap();

        let events = backend.query_user("user-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, LedgerAction::Request);
        assert_eq!(events[1].action, LedgerAction::Grant);
        assert!(events.iter().all(|e| e.user_id == "user-1"));
    }

    #[tokio::test]
    async fn events_are_queryable_by_token() {
        let (ledger, backend) = storage_ledger();
        ledger.add_backend(Arc::clone(&backend) as Arc<dyn LedgerBackend>).await;

        ledger
            .append(&LedgerEvent::new(LedgerAction::Issue, "user-1").token("tok-1"))
            .await
            .unwrap();
        ledger
            .append(
                &LedgerEvent::new(LedgerAction::Validate, "user-1")
                    .token("tok-1")
                    .outcome("TOKEN_EXPIRED"),
            )
            .await
            .unwrap();
        ledger
            .append(&LedgerEvent::new(LedgerAction::Issue, "user-1").token("tok-2"))
            .await
            .unwrap();

        let events = backend.query_token("tok-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].outcome, "TOKEN_EXPIRED");
    }

    #[tokio::test]
    async fn all_backends_failing_is_fail_closed() {
        struct FailingBackend;

        #[async_trait::async_trait]
        impl LedgerBackend for FailingBackend {
            fn name(&self) -> &str {
                "failing"
            }
            async fn append(&self, _event: &LedgerEvent) -> Result<(), LedgerError> {
                Err(LedgerError::BackendFailure {
                    name: "failing".to_owned(),
                    reason: "disk on fire".to_owned(),
                })
            }
        }

        let ledger = ConsentLedger::new();
        ledger.add_backend(Arc::new(FailingBackend)).await;

        let result = ledger
            .append(&LedgerEvent::new(LedgerAction::Issue, "user-1"))
            .await;
        assert!(matches!(result, Err(LedgerError::AllBackendsFailed)));
    }

    #[tokio::test]
    async fn one_healthy_backend_is_enough() {
        struct FailingBackend;

        #[async_trait::async_trait]
        impl LedgerBackend for FailingBackend {
            fn name(&self) -> &str {
                "failing"
            }
            async fn append(&self, _event: &LedgerEvent) -> Result<(), LedgerError> {
                Err(LedgerError::BackendFailure {
                    name: "failing".to_owned(),
                    reason: "nope".to_owned(),
                })
            }
        }

        let (ledger, backend) = storage_ledger();
        ledger.add_backend(Arc::new(FailingBackend)).await;
        ledger.add_backend(Arc::clone(&backend) as Arc<dyn LedgerBackend>).await;

        ledger
            .append(&LedgerEvent::new(LedgerAction::Issue, "user-1").token("tok-1"))
            .await
            .unwrap();
        assert_eq!(backend.query_token("tok-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_backend_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let backend = FileLedgerBackend::new(&path);

        backend
            .append(&LedgerEvent::new(LedgerAction::Issue, "user-1").token("tok-1"))
            .await
            .unwrap();
        backend
            .append(&LedgerEvent::new(LedgerAction::Revoke, "user-1").token("tok-1"))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: LedgerEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, LedgerAction::Issue);
    }
}
