//! Cryptographic primitives for hushvault.
//!
//! Provides AES-256-GCM authenticated encryption with split
//! `{ciphertext, iv, tag}` payloads, HMAC-SHA256 signing with constant-time
//! verification, Argon2id passphrase derivation, HKDF-SHA256 recovery-secret
//! expansion, and zeroize-on-drop key newtypes.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit IV via `OsRng`. IVs are never
//!   reused across fields — GCM nonce reuse is catastrophic.
//! - Ciphertext, IV, and the 16-byte authentication tag are returned as
//!   separate base64 fields so a server can persist them as opaque columns.
//! - Tag verification happens before any plaintext is released; a mismatch
//!   is a hard failure, never a partial decode.
//! - Signature comparison uses `subtle::ConstantTimeEq`.
//! - All key types derive `Zeroize` + `ZeroizeOnDrop` and redact `Debug`.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Key length for AES-256 and HMAC-SHA256 (256 bits).
pub const KEY_LEN: usize = 32;

/// IV length for AES-256-GCM (96 bits).
pub const IV_LEN: usize = 12;

/// Authentication tag length for AES-256-GCM (128 bits).
pub const TAG_LEN: usize = 16;

/// Salt length for passphrase and recovery derivation.
pub const SALT_LEN: usize = 16;

/// The only encryption algorithm this system produces or accepts.
pub const ALGORITHM: &str = "aes-256-gcm";

/// A 256-bit symmetric encryption key, zeroized on drop.
///
/// Used for the vault key and the wrapping keys derived from passphrase or
/// recovery secret. The inner bytes never appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

/// A 256-bit HMAC signing key, zeroized on drop.
///
/// Held exclusively by the consent token service. Never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey([u8; KEY_LEN]);

impl SigningKey {
    /// Create a signing key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random signing key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The result of one field encryption: three opaque base64 columns plus the
/// algorithm marker. The server stores this without being able to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext (without IV or tag).
    pub ciphertext: String,
    /// Base64 96-bit IV, fresh per encryption.
    pub iv: String,
    /// Base64 128-bit GCM authentication tag.
    pub tag: String,
    /// Always [`ALGORITHM`].
    pub algorithm: String,
}

/// Encrypt a plaintext field under the given key with a fresh random IV.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_field(key: &EncryptionKey, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the 16-byte tag; split it off so the server can store
    // ciphertext and tag as separate columns.
    let mut combined = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;
    let tag = combined.split_off(combined.len().saturating_sub(TAG_LEN));

    Ok(EncryptedPayload {
        ciphertext: BASE64.encode(&combined),
        iv: BASE64.encode(nonce),
        tag: BASE64.encode(&tag),
        algorithm: ALGORITHM.to_owned(),
    })
}

/// Decrypt a field produced by [`encrypt_field`].
///
/// The GCM tag is verified before any plaintext is returned. Flipping any
/// bit of ciphertext, IV, or tag makes this fail.
///
/// # Errors
///
/// - [`CryptoError::MalformedPayload`] if a field is not valid base64, the
///   IV or tag has the wrong length, or the algorithm marker is unknown.
/// - [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt_field(key: &EncryptionKey, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
    if payload.algorithm != ALGORITHM {
        return Err(CryptoError::MalformedPayload {
            reason: format!("unsupported algorithm '{}'", payload.algorithm),
        });
    }

    let ciphertext = decode_field(&payload.ciphertext, "ciphertext")?;
    let iv = decode_field(&payload.iv, "iv")?;
    let tag = decode_field(&payload.tag, "tag")?;

    if iv.len() != IV_LEN {
        return Err(CryptoError::MalformedPayload {
            reason: format!("iv must be {IV_LEN} bytes, got {}", iv.len()),
        });
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::MalformedPayload {
            reason: format!("tag must be {TAG_LEN} bytes, got {}", tag.len()),
        });
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&iv);

    // Reassemble ciphertext || tag for the AEAD API.
    let mut combined = Vec::with_capacity(ciphertext.len().saturating_add(TAG_LEN));
    combined.extend_from_slice(&ciphertext);
    combined.extend_from_slice(&tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined,
                aad: &[],
            },
        )
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::MalformedPayload {
            reason: format!("{name} is not valid base64: {e}"),
        })
}

/// Generate a random salt for passphrase or recovery derivation.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit wrapping key from a user passphrase with Argon2id.
///
/// Parameters follow the interactive profile (19 MiB memory, 2 iterations,
/// 1 lane) — this runs on the user's device on every unlock, so it must stay
/// below perceptible latency while still resisting offline guessing.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the Argon2 parameters are
/// rejected or hashing fails.
pub fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> Result<EncryptionKey, CryptoError> {
    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(19_456, 2, 1, Some(KEY_LEN)).map_err(|e| {
            CryptoError::KeyDerivation {
                context: "passphrase".to_owned(),
                reason: e.to_string(),
            }
        })?,
    );

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            context: "passphrase".to_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(key))
}

/// Derive a 256-bit wrapping key from a high-entropy recovery secret with
/// HKDF-SHA256.
///
/// The recovery secret is machine-generated (not human-memorable), so a
/// memory-hard KDF buys nothing here; HKDF expansion with a per-user salt is
/// the right tool and keeps the two wrapping paths cryptographically
/// independent.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_recovery_key(secret: &[u8], salt: &[u8]) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = [0u8; KEY_LEN];
    hk.expand(b"hushvault-recovery-wrap-v1", &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            context: "recovery".to_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(key))
}

/// Compute an HMAC-SHA256 signature over the given bytes.
#[must_use]
pub fn sign(key: &SigningKey, data: &[u8]) -> [u8; 32] {
    // HMAC-SHA256 accepts any key length per RFC 2104; a 32-byte key never
    // fails construction. Qualified call: `KeyInit` (AEAD) also provides a
    // `new_from_slice` for this type.
    #[allow(clippy::unwrap_used)]
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 signature in constant time.
///
/// Returns `false` for any mismatch, including wrong-length signatures.
#[must_use]
pub fn verify(key: &SigningKey, data: &[u8], signature: &[u8]) -> bool {
    let expected = sign(key, data);
    if signature.len() != expected.len() {
        return false;
    }
    expected.ct_eq(signature).into()
}

/// SHA-256 a session token, hex-encoded. One-way: the raw token cannot be
/// recovered from the stored hash.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(digest)
}

/// Generate a 256-bit random bearer token, hex-encoded.
#[must_use]
pub fn generate_bearer_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
