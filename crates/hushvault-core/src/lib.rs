//! Core library for hushvault.
//!
//! Implements the consent-gated personal data vault: cryptographic
//! primitives, dot-namespaced scopes, signed consent tokens, hash-stored
//! session tokens, the append-only consent ledger, the pending-consent
//! workflow state machine, dual-wrapped vault key envelopes, and the
//! opaque encrypted-attribute store. This crate depends on
//! `hushvault-storage` for persistence and knows nothing about HTTP.

pub mod attribute;
pub mod cache;
pub mod consent;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod scope;
pub mod session;
pub mod vaultkey;
pub mod workflow;
