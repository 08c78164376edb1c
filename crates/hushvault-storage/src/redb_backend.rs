//! Pure-Rust redb storage backend.
//!
//! Persistent backend for deployments that need durability without a C/C++
//! FFI dependency. Feature-gated behind `redb-backend`. redb is fully
//! transactional; every operation here runs in its own transaction on the
//! Tokio blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{StorageBackend, StorageError};

/// All records live in one table; the `consent/`, `sessions/`, and `vault/`
/// namespaces are encoded in the keys by the record stores above.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// A storage backend backed by redb (pure Rust, B-tree based).
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the database file cannot be opened
    /// or created, or a transaction error if the records table cannot be
    /// initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // First open of the table creates it; later transactions can then
        // assume it exists.
        write_txn(&db, |_table| Ok(()))?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// The filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking redb operation on the Tokio blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StorageError::Transaction {
                reason: format!("storage worker panicked: {e}"),
            })?
    }
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Open a write transaction, hand the records table to `op`, commit.
fn write_txn<T>(
    db: &Database,
    op: impl FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let txn = db.begin_write().map_err(txn_error)?;
    let out = {
        let mut table = txn.open_table(RECORDS).map_err(table_error)?;
        op(&mut table)?
    };
    txn.commit().map_err(txn_error)?;
    Ok(out)
}

/// Open a read transaction and hand the records table to `op`.
fn read_txn<T>(
    db: &Database,
    op: impl FnOnce(&redb::ReadOnlyTable<&'static str, &'static [u8]>) -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let txn = db.begin_read().map_err(txn_error)?;
    let table = txn.open_table(RECORDS).map_err(table_error)?;
    op(&table)
}

fn txn_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn table_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::MissingTable {
        name: format!("records: {e}"),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            read_txn(db, |table| {
                let value = table.get(key.as_str()).map_err(|e| StorageError::Read {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok(value.map(|guard| guard.value().to_vec()))
            })
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.run(move |db| {
            write_txn(db, |table| {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| StorageError::Write {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(())
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            write_txn(db, |table| {
                // remove() returns Ok(None) for a missing key, keeping
                // delete idempotent.
                table
                    .remove(key.as_str())
                    .map_err(|e| StorageError::Delete {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(())
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.run(move |db| {
            read_txn(db, |table| {
                let list_error = |e: &dyn std::fmt::Display| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                };

                let mut keys = Vec::new();
                for entry in table.range(prefix.as_str()..).map_err(|e| list_error(&e))? {
                    let (key, _) = entry.map_err(|e| list_error(&e))?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    keys.push(key.to_owned());
                }
                Ok(keys)
            })
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            read_txn(db, |table| {
                let found = table
                    .get(key.as_str())
                    .map_err(|e| StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?
                    .is_some();
                Ok(found)
            })
        })
        .await
    }
}
