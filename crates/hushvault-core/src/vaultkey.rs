//! Vault key envelopes (bring-your-own-key).
//!
//! The vault key is generated on the owner's device and wrapped twice before
//! it ever leaves: once under a key derived from the owner's passphrase
//! (Argon2id) and once under a key derived from a machine-generated recovery
//! secret (HKDF-SHA256). The server persists both wrapped copies verbatim and
//! holds neither wrapping secret, so it can never open the vault.
//!
//! The client-side wrap/unwrap functions live here because the owning client
//! links this crate; [`VaultKeyStore`] is the server half and only ever sees
//! opaque envelopes.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use hushvault_storage::StorageBackend;

use crate::crypto::{self, EncryptedPayload, EncryptionKey, SALT_LEN};
use crate::error::{CryptoError, VaultKeyError};

/// Storage prefix for vault key envelopes, keyed by user id.
const RECORD_PREFIX: &str = "vault/keys/";

/// How the owner unlocks the vault. Stored for the client's benefit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Unlock by passphrase (recovery secret as backup).
    Passphrase,
    /// Unlock by recovery secret only.
    Recovery,
}

/// One wrapped copy of the vault key: the AES-256-GCM envelope plus the salt
/// its wrapping key was derived with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// The encrypted vault key, tag split out per the payload convention.
    #[serde(flatten)]
    pub envelope: EncryptedPayload,
    /// Base64 derivation salt.
    pub salt: String,
}

/// The dual-wrapped vault key envelope the server stores verbatim.
///
/// Both copies decrypt to the identical vault key; the two wrapping secrets
/// are independent, so losing the passphrase does not lose the vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKeyRecord {
    /// The owning user.
    pub user_id: String,
    /// Passphrase-wrapped copy.
    pub passphrase_wrapped: WrappedKey,
    /// Recovery-wrapped copy.
    pub recovery_wrapped: WrappedKey,
    /// The owner's chosen unlock method.
    pub auth_method: AuthMethod,
    /// When the vault was set up.
    pub created_at: DateTime<Utc>,
}

/// Wrap a vault key under a key derived from the owner's passphrase.
///
/// Runs on the owner's device. A fresh salt is generated per wrap.
///
/// # Errors
///
/// Returns [`CryptoError`] if derivation or encryption fails.
pub fn wrap_vault_key(
    vault_key: &EncryptionKey,
    passphrase: &str,
) -> Result<WrappedKey, CryptoError> {
    let salt = crypto::generate_salt();
    let wrapping_key = crypto::derive_passphrase_key(passphrase, &salt)?;
    let envelope = crypto::encrypt_field(&wrapping_key, vault_key.as_bytes())?;
    Ok(WrappedKey {
        envelope,
        salt: BASE64.encode(salt),
    })
}

/// Recover the vault key from its passphrase-wrapped copy.
///
/// # Errors
///
/// - [`CryptoError::MalformedPayload`] if the salt or envelope is malformed.
/// - [`CryptoError::Decryption`] for a wrong passphrase or tampered copy.
pub fn unwrap_with_passphrase(
    wrapped: &WrappedKey,
    passphrase: &str,
) -> Result<EncryptionKey, CryptoError> {
    let salt = decode_salt(&wrapped.salt)?;
    let wrapping_key = crypto::derive_passphrase_key(passphrase, &salt)?;
    let raw = crypto::decrypt_field(&wrapping_key, &wrapped.envelope)?;
    into_key(raw)
}

/// Wrap a vault key under a key derived from a high-entropy recovery secret.
///
/// # Errors
///
/// Returns [`CryptoError`] if derivation or encryption fails.
pub fn wrap_for_recovery(
    vault_key: &EncryptionKey,
    recovery_secret: &[u8],
) -> Result<WrappedKey, CryptoError> {
    let salt = crypto::generate_salt();
    let wrapping_key = crypto::derive_recovery_key(recovery_secret, &salt)?;
    let envelope = crypto::encrypt_field(&wrapping_key, vault_key.as_bytes())?;
    Ok(WrappedKey {
        envelope,
        salt: BASE64.encode(salt),
    })
}

/// Recover the vault key from its recovery-wrapped copy.
///
/// # Errors
///
/// Same failure modes as [`unwrap_with_passphrase`].
pub fn unwrap_with_recovery(
    wrapped: &WrappedKey,
    recovery_secret: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let salt = decode_salt(&wrapped.salt)?;
    let wrapping_key = crypto::derive_recovery_key(recovery_secret, &salt)?;
    let raw = crypto::decrypt_field(&wrapping_key, &wrapped.envelope)?;
    into_key(raw)
}

fn decode_salt(salt: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = BASE64.decode(salt).map_err(|e| CryptoError::MalformedPayload {
        reason: format!("salt is not valid base64: {e}"),
    })?;
    if raw.len() != SALT_LEN {
        return Err(CryptoError::MalformedPayload {
            reason: format!("salt must be {SALT_LEN} bytes, got {}", raw.len()),
        });
    }
    Ok(raw)
}

fn into_key(raw: Vec<u8>) -> Result<EncryptionKey, CryptoError> {
    let bytes: [u8; crypto::KEY_LEN] =
        raw.try_into().map_err(|v: Vec<u8>| CryptoError::MalformedPayload {
            reason: format!("unwrapped key must be {} bytes, got {}", crypto::KEY_LEN, v.len()),
        })?;
    Ok(EncryptionKey::from_bytes(bytes))
}

/// Server-side store of vault key envelopes. Persists what the client sends
/// and returns it on demand; never derives, unwraps, or inspects a key.
pub struct VaultKeyStore {
    storage: Arc<dyn StorageBackend>,
}

impl VaultKeyStore {
    /// Create a store over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Persist a user's envelope. One-shot: a second setup for the same user
    /// is rejected so a client bug cannot silently replace the key that
    /// encrypts all existing data.
    ///
    /// # Errors
    ///
    /// - [`VaultKeyError::AlreadyExists`] if the user already has a vault.
    /// - [`VaultKeyError::Storage`] / [`VaultKeyError::Serialization`] on
    ///   infrastructure failure.
    pub async fn setup(&self, record: &VaultKeyRecord) -> Result<(), VaultKeyError> {
        let key = format!("{RECORD_PREFIX}{}", record.user_id);
        if self.storage.exists(&key).await? {
            return Err(VaultKeyError::AlreadyExists);
        }

        let bytes = serde_json::to_vec(record).map_err(|e| VaultKeyError::Serialization {
            reason: e.to_string(),
        })?;
        self.storage.put(&key, &bytes).await?;

        info!(user_id = %record.user_id, "vault key envelope stored");
        Ok(())
    }

    /// Whether a vault exists for this user.
    ///
    /// # Errors
    ///
    /// Returns [`VaultKeyError::Storage`] on backend failure.
    pub async fn exists(&self, user_id: &str) -> Result<bool, VaultKeyError> {
        Ok(self.storage.exists(&format!("{RECORD_PREFIX}{user_id}")).await?)
    }

    /// Fetch a user's envelope for client-side unwrap.
    ///
    /// # Errors
    ///
    /// Returns [`VaultKeyError::NotFound`] if no vault exists.
    pub async fn get(&self, user_id: &str) -> Result<VaultKeyRecord, VaultKeyError> {
        let key = format!("{RECORD_PREFIX}{user_id}");
        let bytes = self.storage.get(&key).await?.ok_or(VaultKeyError::NotFound)?;
        serde_json::from_slice(&bytes).map_err(|e| VaultKeyError::Serialization {
            reason: format!("corrupt vault key record for '{user_id}': {e}"),
        })
    }
}

impl std::fmt::Debug for VaultKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKeyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hushvault_storage::MemoryBackend;

    fn record(user_id: &str) -> VaultKeyRecord {
        let vault_key = EncryptionKey::generate();
        VaultKeyRecord {
            user_id: user_id.to_owned(),
            passphrase_wrapped: wrap_vault_key(&vault_key, "correct horse").unwrap(),
            recovery_wrapped: wrap_for_recovery(&vault_key, b"recovery-secret-material").unwrap(),
            auth_method: AuthMethod::Passphrase,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn both_copies_unwrap_to_the_same_key() {
        let vault_key = EncryptionKey::generate();
        let by_pass = wrap_vault_key(&vault_key, "hunter2 but longer").unwrap();
        let by_recovery = wrap_for_recovery(&vault_key, b"0123456789abcdef-recovery").unwrap();

        let k1 = unwrap_with_passphrase(&by_pass, "hunter2 but longer").unwrap();
        let k2 = unwrap_with_recovery(&by_recovery, b"0123456789abcdef-recovery").unwrap();
        assert_eq!(k1, vault_key);
        assert_eq!(k2, vault_key);
    }

    #[test]
    fn wrong_passphrase_fails_hard() {
        let vault_key = EncryptionKey::generate();
        let wrapped = wrap_vault_key(&vault_key, "right passphrase").unwrap();
        let result = unwrap_with_passphrase(&wrapped, "wrong passphrase");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn wrong_recovery_secret_fails_hard() {
        let vault_key = EncryptionKey::generate();
        let wrapped = wrap_for_recovery(&vault_key, b"the real secret").unwrap();
        let result = unwrap_with_recovery(&wrapped, b"an impostor secret");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn wrapping_secrets_are_not_interchangeable() {
        let vault_key = EncryptionKey::generate();
        let by_pass = wrap_vault_key(&vault_key, "shared-string").unwrap();
        // Same string via the recovery path derives a different key.
        let result = unwrap_with_recovery(&by_pass, b"shared-string");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn fresh_salt_per_wrap() {
        let vault_key = EncryptionKey::generate();
        let w1 = wrap_vault_key(&vault_key, "pass").unwrap();
        let w2 = wrap_vault_key(&vault_key, "pass").unwrap();
        assert_ne!(w1.salt, w2.salt);
        assert_ne!(w1.envelope.ciphertext, w2.envelope.ciphertext);
    }

    #[test]
    fn malformed_salt_rejected() {
        let vault_key = EncryptionKey::generate();
        let mut wrapped = wrap_vault_key(&vault_key, "pass").unwrap();
        wrapped.salt = "!!not-base64!!".to_owned();
        assert!(matches!(
            unwrap_with_passphrase(&wrapped, "pass"),
            Err(CryptoError::MalformedPayload { .. })
        ));

        wrapped.salt = BASE64.encode([1u8; 4]);
        assert!(matches!(
            unwrap_with_passphrase(&wrapped, "pass"),
            Err(CryptoError::MalformedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn setup_is_one_shot() {
        let store = VaultKeyStore::new(Arc::new(MemoryBackend::new()));
        let rec = record("user-1");

        store.setup(&rec).await.unwrap();
        let result = store.setup(&rec).await;
        assert!(matches!(result, Err(VaultKeyError::AlreadyExists)));
    }

    #[tokio::test]
    async fn stored_envelope_roundtrips_verbatim() {
        let store = VaultKeyStore::new(Arc::new(MemoryBackend::new()));
        let rec = record("user-1");
        store.setup(&rec).await.unwrap();

        let fetched = store.get("user-1").await.unwrap();
        assert_eq!(fetched.passphrase_wrapped, rec.passphrase_wrapped);
        assert_eq!(fetched.recovery_wrapped, rec.recovery_wrapped);
        assert_eq!(fetched.auth_method, AuthMethod::Passphrase);
    }

    #[tokio::test]
    async fn exists_and_not_found() {
        let store = VaultKeyStore::new(Arc::new(MemoryBackend::new()));
        assert!(!store.exists("user-1").await.unwrap());
        assert!(matches!(store.get("user-1").await, Err(VaultKeyError::NotFound)));

        store.setup(&record("user-1")).await.unwrap();
        assert!(store.exists("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn fetched_envelope_still_unwraps() {
        let vault_key = EncryptionKey::generate();
        let rec = VaultKeyRecord {
            user_id: "user-1".to_owned(),
            passphrase_wrapped: wrap_vault_key(&vault_key, "my passphrase").unwrap(),
            recovery_wrapped: wrap_for_recovery(&vault_key, b"my recovery").unwrap(),
            auth_method: AuthMethod::Passphrase,
            created_at: Utc::now(),
        };

        let store = VaultKeyStore::new(Arc::new(MemoryBackend::new()));
        store.setup(&rec).await.unwrap();
        let fetched = store.get("user-1").await.unwrap();

        let unwrapped = unwrap_with_passphrase(&fetched.passphrase_wrapped, "my passphrase").unwrap();
        assert_eq!(unwrapped, vault_key);
    }
}
