//! Server configuration for hushvault.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `HUSHVAULT_*` environment variables.

use std::net::SocketAddr;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Path to the JSON-lines ledger file (optional extra ledger sink).
    pub ledger_file_path: Option<String>,
    /// Hex-encoded 32-byte HMAC signing key. When absent a per-process key
    /// is generated, which invalidates outstanding consent tokens on restart.
    pub signing_key_hex: Option<String>,
    /// How long a pending consent request may wait before timing out.
    pub pending_max_wait_secs: u64,
    /// Seconds between timeout sweeps.
    pub sweep_interval_secs: u64,
    /// Session token lifetime in seconds.
    pub session_ttl_secs: u64,
    /// Consent token lifetime (on grant or self-issue) in seconds.
    pub consent_ttl_secs: u64,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// Redb persistent storage.
    Redb { path: String },
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds to `0.0.0.0`)
    /// - `HUSHVAULT_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8600`)
    /// - `HUSHVAULT_STORAGE` — `memory` or `redb` (default: `memory`)
    /// - `HUSHVAULT_STORAGE_PATH` — path for the redb backend (default: `./data`)
    /// - `HUSHVAULT_LOG_LEVEL` — log filter (default: `info`)
    /// - `HUSHVAULT_LEDGER_FILE` — path to a JSON-lines ledger file (optional)
    /// - `HUSHVAULT_SIGNING_KEY` — hex-encoded 32-byte consent signing key (optional)
    /// - `HUSHVAULT_PENDING_MAX_WAIT` — seconds before a pending request times out (default: `3600`)
    /// - `HUSHVAULT_SWEEP_INTERVAL` — seconds between timeout sweeps (default: `60`)
    /// - `HUSHVAULT_SESSION_TTL` — session lifetime in seconds (default: `86400`)
    /// - `HUSHVAULT_CONSENT_TTL` — consent token lifetime in seconds (default: `3600`)
    /// - `HUSHVAULT_DISABLE_MLOCK` — skip `mlockall` for dev environments (default: `false`)
    #[must_use]
    pub fn from_env() -> Self {
        // Priority: HUSHVAULT_BIND_ADDR > PORT > default 127.0.0.1:8600
        let bind_addr = if let Ok(addr) = std::env::var("HUSHVAULT_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8600)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8600);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8600))
        };

        let storage_path =
            std::env::var("HUSHVAULT_STORAGE_PATH").unwrap_or_else(|_| "./data".to_owned());

        let storage_backend = match std::env::var("HUSHVAULT_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "redb" => StorageBackendType::Redb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let log_level = std::env::var("HUSHVAULT_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        Self {
            bind_addr,
            storage_backend,
            log_level,
            ledger_file_path: std::env::var("HUSHVAULT_LEDGER_FILE").ok(),
            signing_key_hex: std::env::var("HUSHVAULT_SIGNING_KEY").ok(),
            pending_max_wait_secs: env_u64("HUSHVAULT_PENDING_MAX_WAIT", 3600),
            sweep_interval_secs: env_u64("HUSHVAULT_SWEEP_INTERVAL", 60),
            session_ttl_secs: env_u64("HUSHVAULT_SESSION_TTL", 86_400),
            consent_ttl_secs: env_u64("HUSHVAULT_CONSENT_TTL", 3600),
            disable_mlock: std::env::var("HUSHVAULT_DISABLE_MLOCK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state, so only defaults are
    // checked here; the parse helpers are covered directly.

    #[test]
    fn env_u64_falls_back_on_missing_or_garbage() {
        assert_eq!(env_u64("HUSHVAULT_TEST_DOES_NOT_EXIST", 42), 42);
    }

    #[test]
    fn default_bind_addr_is_loopback() {
        // Only meaningful when the variables are unset, which is the normal
        // test environment.
        if std::env::var("HUSHVAULT_BIND_ADDR").is_err() && std::env::var("PORT").is_err() {
            let config = ServerConfig::from_env();
            assert!(config.bind_addr.ip().is_loopback());
            assert_eq!(config.bind_addr.port(), 8600);
        }
    }
}
