//! HTTP server for hushvault.
//!
//! Exposes the consent-gated vault over an axum API: session lifecycle,
//! consent token issue/validate/revoke, the pending-consent workflow with an
//! SSE notification stream, vault key envelope setup, and the encrypted
//! attribute store. Library crate so routes and middleware are testable; the
//! binary lives in `main.rs`.

pub mod config;
pub mod error;
pub mod events;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;
