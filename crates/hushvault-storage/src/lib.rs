//! Storage backend abstraction for hushvault.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value storage
//! interface that knows nothing about consent tokens, ciphertext envelopes,
//! or workflow records. `hushvault-core` layers its record stores on top of a
//! backend; everything sensitive is either a one-way hash or ciphertext by
//! the time it reaches this layer.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBackend`] — in-memory, for tests and development
//! - [`RedbBackend`] — pure-Rust persistent storage (feature `redb-backend`)

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g.
/// `consent/tokens/{token_id}`, `vault/attrs/{user_id}/{domain}/{key}`).
/// Values are opaque byte arrays — serialized records whose sensitive fields
/// are already hashed or encrypted by the caller.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Idempotent — deleting a non-existent key is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in lexicographic
    /// order. Returns keys only, never values.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and
    /// checks for `Some`. Backends may override this with a cheaper probe.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
