//! Encrypted attribute store.
//!
//! Attributes are the vault's payload: per-field AES-256-GCM ciphertext
//! produced on the owner's device with the vault key this server never
//! holds. The store persists and lists records as opaque data; decryption is
//! a client concern via [`crate::crypto::decrypt_field`].
//!
//! Uniqueness is `(user_id, domain, attribute_key)` — writing the same triple
//! again replaces the previous ciphertext.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use hushvault_storage::StorageBackend;

use crate::crypto::{EncryptedPayload, ALGORITHM};
use crate::error::AttributeError;

/// Storage prefix for attribute records.
const RECORD_PREFIX: &str = "vault/attrs/";

/// One encrypted attribute as stored and returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedAttribute {
    /// Namespace within the vault, e.g. `food` or `health`.
    pub domain: String,
    /// Key within the domain, e.g. `dietary_preference`.
    pub attribute_key: String,
    /// The encrypted value.
    #[serde(flatten)]
    pub payload: EncryptedPayload,
    /// Where the value came from, if the client recorded it.
    pub source: Option<String>,
    /// Client-side confidence in the value, 0.0 to 1.0.
    pub confidence: Option<f64>,
    /// Plaintext display label. Must never contain the value itself.
    pub display_name: Option<String>,
    /// Last write time, set by the store.
    pub updated_at: DateTime<Utc>,
}

/// Persists encrypted attributes keyed `(user_id, domain, attribute_key)`.
pub struct AttributeStore {
    storage: Arc<dyn StorageBackend>,
}

impl AttributeStore {
    /// Create a store over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Insert or replace an attribute.
    ///
    /// `domain` and `attribute_key` must each be one non-empty key segment:
    /// a `/` in either would let two distinct triples share a record key.
    /// The record's declared algorithm must be `aes-256-gcm` — the store
    /// refuses to hold ciphertext it could not describe.
    ///
    /// # Errors
    ///
    /// - [`AttributeError::InvalidField`] for an empty or `/`-containing
    ///   `domain` or `attribute_key`.
    /// - [`AttributeError::UnsupportedAlgorithm`] for any other algorithm.
    /// - [`AttributeError::Storage`] / [`AttributeError::Serialization`] on
    ///   infrastructure failure.
    pub async fn upsert(
        &self,
        user_id: &str,
        mut attribute: EncryptedAttribute,
    ) -> Result<EncryptedAttribute, AttributeError> {
        check_segment("domain", &attribute.domain)?;
        check_segment("attribute_key", &attribute.attribute_key)?;

        if attribute.payload.algorithm != ALGORITHM {
            return Err(AttributeError::UnsupportedAlgorithm {
                algorithm: attribute.payload.algorithm.clone(),
            });
        }

        attribute.updated_at = Utc::now();
        let key = record_key(user_id, &attribute.domain, &attribute.attribute_key);
        let bytes = serde_json::to_vec(&attribute).map_err(|e| AttributeError::Serialization {
            reason: e.to_string(),
        })?;
        self.storage.put(&key, &bytes).await?;

        debug!(
            user_id,
            domain = %attribute.domain,
            attribute_key = %attribute.attribute_key,
            "attribute upserted"
        );
        Ok(attribute)
    }

    /// Fetch one attribute.
    ///
    /// # Errors
    ///
    /// Returns [`AttributeError::NotFound`] if the triple does not exist.
    pub async fn get(
        &self,
        user_id: &str,
        domain: &str,
        attribute_key: &str,
    ) -> Result<EncryptedAttribute, AttributeError> {
        let key = record_key(user_id, domain, attribute_key);
        let bytes = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| AttributeError::NotFound {
                domain: domain.to_owned(),
                attribute_key: attribute_key.to_owned(),
            })?;
        decode(&key, &bytes)
    }

    /// All attributes for a user, optionally restricted to one domain.
    ///
    /// # Errors
    ///
    /// Returns [`AttributeError::Storage`] on backend failure.
    pub async fn list(
        &self,
        user_id: &str,
        domain: Option<&str>,
    ) -> Result<Vec<EncryptedAttribute>, AttributeError> {
        let prefix = match domain {
            Some(domain) => format!("{RECORD_PREFIX}{user_id}/{domain}/"),
            None => format!("{RECORD_PREFIX}{user_id}/"),
        };

        let keys = self.storage.list(&prefix).await?;
        let mut attributes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.storage.get(&key).await? {
                attributes.push(decode(&key, &bytes)?);
            }
        }
        Ok(attributes)
    }

    /// Delete one attribute. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AttributeError::Storage`] on backend failure.
    pub async fn delete(
        &self,
        user_id: &str,
        domain: &str,
        attribute_key: &str,
    ) -> Result<(), AttributeError> {
        self.storage
            .delete(&record_key(user_id, domain, attribute_key))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore").finish_non_exhaustive()
    }
}

// Keys are `vault/attrs/{user}/{domain}/{attribute_key}`; upsert guarantees
// the last two parts are single segments, so keys parse back unambiguously.
fn record_key(user_id: &str, domain: &str, attribute_key: &str) -> String {
    format!("{RECORD_PREFIX}{user_id}/{domain}/{attribute_key}")
}

fn check_segment(field: &'static str, value: &str) -> Result<(), AttributeError> {
    if value.is_empty() {
        return Err(AttributeError::InvalidField {
            field,
            reason: "must not be empty".to_owned(),
        });
    }
    if value.contains('/') {
        return Err(AttributeError::InvalidField {
            field,
            reason: format!("must not contain '/': {value:?}"),
        });
    }
    Ok(())
}

fn decode(key: &str, bytes: &[u8]) -> Result<EncryptedAttribute, AttributeError> {
    serde_json::from_slice(bytes).map_err(|e| AttributeError::Serialization {
        reason: format!("corrupt attribute record at '{key}': {e}"),
    })
}
