//! Storage error types.
//!
//! Each variant carries the key or prefix involved so failures can be
//! diagnosed from logs alone. Values never appear in error messages — by the
//! time data reaches this crate it is ciphertext or a hash, but keys are the
//! only part that is safe *and* useful to report.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open the storage backend at the given path.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key from storage.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list keys with the given prefix.
    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A required table was not found or could not be created.
    #[error("missing table '{name}'")]
    MissingTable { name: String },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },
}
