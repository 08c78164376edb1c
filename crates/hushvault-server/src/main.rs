//! hushvault server entry point.
//!
//! Bootstraps storage, the consent ledger, and all core subsystems, then
//! starts the axum HTTP server with graceful shutdown. A background sweeper
//! times out overdue consent requests alongside the server and is cancelled
//! on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use chrono::Duration as ChronoDuration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use hushvault_core::attribute::AttributeStore;
use hushvault_core::cache::TtlCache;
use hushvault_core::consent::ConsentTokenService;
use hushvault_core::crypto::SigningKey;
use hushvault_core::ledger::{ConsentLedger, FileLedgerBackend, StorageLedgerBackend};
use hushvault_core::session::SessionStore;
use hushvault_core::vaultkey::VaultKeyStore;
use hushvault_core::workflow::{ConsentNotifier, ConsentWorkflow};
use hushvault_storage::MemoryBackend;

use hushvault_server::config::{ServerConfig, StorageBackendType};
use hushvault_server::events::EventHub;
use hushvault_server::hardening;
use hushvault_server::middleware::session_auth;
use hushvault_server::routes;
use hushvault_server::state::AppState;

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Vault-exists cache: small and short-lived, setup overwrites eagerly.
const VAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const VAULT_CACHE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Production hardening: disable core dumps (always) and lock memory
    // (unless disabled). Runs before logging is initialized, so warnings go
    // to stderr.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "hushvault starting");

    let state = build_app_state(&config).await?;

    // Shutdown signal channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the pending-consent timeout sweeper.
    let sweeper_handle = {
        let workflow = Arc::clone(&state.workflow);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.sweep_interval_secs;
        let max_wait = ChronoDuration::seconds(
            i64::try_from(config.pending_max_wait_secs).unwrap_or(i64::MAX),
        );
        tokio::spawn(async move {
            timeout_sweeper(workflow, &mut rx, interval_secs, max_wait).await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "hushvault server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;

    info!("hushvault server stopped");
    Ok(())
}

/// Build the shared application state.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    // Bootstrap storage backend.
    let storage: Arc<dyn hushvault_storage::StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "redb-backend")]
        StorageBackendType::Redb { path } => {
            info!(path = %path, "using redb storage");
            Arc::new(
                hushvault_storage::RedbBackend::open(path)
                    .context("failed to open redb storage")?,
            )
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageBackendType::Redb { .. } => {
            anyhow::bail!("redb backend requested but feature 'redb-backend' is not enabled");
        }
    };

    // Ledger: the storage-indexed backend always, a file sink if configured.
    let ledger_query = Arc::new(StorageLedgerBackend::new(Arc::clone(&storage)));
    let ledger = Arc::new(ConsentLedger::new());
    ledger
        .add_backend(Arc::clone(&ledger_query) as Arc<dyn hushvault_core::ledger::LedgerBackend>)
        .await;
    if let Some(ref path) = config.ledger_file_path {
        ledger
            .add_backend(Arc::new(FileLedgerBackend::new(path)))
            .await;
        info!(path = %path, "file ledger backend registered");
    }

    // Consent signing key: configured, or ephemeral per process.
    let signing_key = match &config.signing_key_hex {
        Some(hex_key) => {
            let bytes: [u8; 32] = hex::decode(hex_key)
                .ok()
                .and_then(|v| v.try_into().ok())
                .context("HUSHVAULT_SIGNING_KEY must be 64 hex characters")?;
            SigningKey::from_bytes(bytes)
        }
        None => {
            warn!("no HUSHVAULT_SIGNING_KEY set — consent tokens will not survive a restart");
            SigningKey::generate()
        }
    };

    let tokens = Arc::new(ConsentTokenService::new(
        signing_key,
        Arc::clone(&storage),
        Arc::clone(&ledger),
    ));
    let events = Arc::new(EventHub::new());

    #[allow(unused_mut)]
    let mut workflow = ConsentWorkflow::new(
        Arc::clone(&storage),
        Arc::clone(&tokens),
        ledger,
        Arc::clone(&events) as Arc<dyn ConsentNotifier>,
        ChronoDuration::seconds(i64::try_from(config.consent_ttl_secs).unwrap_or(3600)),
    );

    #[cfg(feature = "dev-auto-grant")]
    {
        warn!("dev-auto-grant build: pending requests are granted without owner approval");
        workflow.enable_auto_grant();
    }

    Ok(Arc::new(AppState {
        tokens,
        sessions: Arc::new(SessionStore::new(Arc::clone(&storage))),
        workflow: Arc::new(workflow),
        ledger_query,
        vault_keys: Arc::new(VaultKeyStore::new(Arc::clone(&storage))),
        attributes: Arc::new(AttributeStore::new(storage)),
        events,
        vault_cache: TtlCache::new(VAULT_CACHE_TTL, VAULT_CACHE_CAPACITY),
        session_ttl: ChronoDuration::seconds(i64::try_from(config.session_ttl_secs).unwrap_or(86_400)),
        consent_ttl: ChronoDuration::seconds(i64::try_from(config.consent_ttl_secs).unwrap_or(3600)),
    }))
}

/// Build the axum router with all routes and middleware.
fn build_router(state: Arc<AppState>) -> Router {
    // Owner-facing routes go through session authentication.
    let authenticated = Router::new()
        .nest("/v1/consent", routes::consent::router())
        .nest("/v1/session", routes::session::router())
        .nest("/v1/vault", routes::vault::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            session_auth,
        ));

    // Session issue is the login boundary; concurrency-limit it so a burst
    // of logins cannot exhaust storage.
    let login = Router::new()
        .nest("/v1/session", routes::session::public_router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(16));

    // CORS — permissive origins, but the only custom headers allowed are the
    // two token carriers.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-session-token"),
            axum::http::HeaderName::from_static("x-consent-token"),
        ]);

    Router::new()
        .merge(authenticated)
        .merge(login)
        .nest("/v1/consent", routes::consent::public_router())
        .nest("/v1/vault", routes::vault::consent_router())
        .nest("/v1/sys", routes::sys::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Maximum retries per tick when the storage backend is unreachable.
const SWEEP_MAX_RETRIES: u32 = 3;

/// Background worker that periodically times out overdue consent requests.
///
/// If storage is unreachable during a sweep, the worker retries with
/// exponential backoff (1s, 2s, 4s) before giving up on that tick. A
/// consecutive-failure counter escalates log severity so operators notice
/// persistent issues without being spammed on transient blips.
async fn timeout_sweeper(
    workflow: Arc<ConsentWorkflow>,
    shutdown: &mut watch::Receiver<bool>,
    interval_secs: u64,
    max_wait: ChronoDuration,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let mut consecutive_failures: u32 = 0;
    info!(interval_secs, "consent timeout sweeper started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match retry_sweep(&workflow, shutdown, max_wait).await {
                    Ok(None) => {
                        info!("consent timeout sweeper shutting down");
                        return;
                    }
                    Ok(Some(0)) => {
                        consecutive_failures = 0;
                    }
                    Ok(Some(expired)) => {
                        consecutive_failures = 0;
                        info!(expired, "consent timeout sweep complete");
                    }
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                error = %last_err,
                                consecutive_failures,
                                "timeout sweep persistently failing — storage may be down"
                            );
                        } else {
                            warn!(
                                error = %last_err,
                                consecutive_failures,
                                retries = SWEEP_MAX_RETRIES,
                                "timeout sweep failed after retries, will retry next tick"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("consent timeout sweeper shutting down");
                return;
            }
        }
    }
}

/// Attempt `expire_overdue` with exponential backoff. Returns:
/// - `Ok(Some(expired))` on success
/// - `Ok(None)` if shutdown was signalled during retry
/// - `Err(last_error)` if all retries exhausted
async fn retry_sweep(
    workflow: &Arc<ConsentWorkflow>,
    shutdown: &mut watch::Receiver<bool>,
    max_wait: ChronoDuration,
) -> Result<Option<usize>, String> {
    let mut last_err = String::new();

    for attempt in 0..=SWEEP_MAX_RETRIES {
        match workflow.expire_overdue(max_wait).await {
            Ok(expired) => return Ok(Some(expired)),
            Err(e) => {
                last_err = e.to_string();

                if attempt == SWEEP_MAX_RETRIES {
                    break;
                }

                // Exponential backoff: 1s, 2s, 4s
                let backoff = Duration::from_secs(1u64 << attempt);
                tracing::debug!(
                    attempt = attempt.saturating_add(1),
                    max = SWEEP_MAX_RETRIES.saturating_add(1),
                    error = %e,
                    "timeout sweep failed, retrying"
                );

                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Ok(None);
                    }
                }
            }
        }
    }

    Err(last_err)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Apply production hardening before logging is initialized.
///
/// Uses `eprintln` because structured logging is not yet available.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!(
            "WARNING: mlock disabled via HUSHVAULT_DISABLE_MLOCK — key material may be swapped to disk"
        );
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set HUSHVAULT_DISABLE_MLOCK=true for dev)");
    }
}
