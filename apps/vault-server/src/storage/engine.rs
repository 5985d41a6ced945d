// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-tenant vault store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `records`: record key → encrypted record bytes (JSON)
//! - `vectors`: record key → embedding (little-endian `f32`s)
//!
//! In isolated mode the record key is the record id. In shared mode every
//! tenant writes into the same file and keys are `tenant_id/record_id`, so
//! per-tenant queries become prefix range scans.
//!
//! The pool only needs the [`StorageEngine`] / [`StoreHandle`] traits; tests
//! substitute their own engines through them.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};

// =============================================================================
// Table Definitions
// =============================================================================

type BytesTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Primary table: record key → serialized record.
const RECORDS: BytesTable = TableDefinition::new("records");

/// Embeddings: record key → packed `f32` vector.
const VECTORS: BytesTable = TableDefinition::new("vectors");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store handle is closed")]
    Closed,

    #[error("store lock poisoned")]
    Poisoned,

    #[error("integrity check failed: {0}")]
    Integrity(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Engine Traits
// =============================================================================

/// Factory for storage handles.
pub trait StorageEngine: Send + Sync + 'static {
    type Handle: StoreHandle;

    /// Open (or create) the store at `path` with its schema in place.
    fn open(&self, path: &Path) -> StoreResult<Self::Handle>;

    /// Verify a store file at rest without activating it.
    fn verify(&self, path: &Path) -> StoreResult<()>;
}

/// The fixed operation set of an open store.
///
/// `tenant` scopes keys in shared mode and is `None` in isolated mode.
pub trait StoreHandle: Send + Sync + 'static {
    fn insert_record(&self, tenant: Option<&str>, id: &str, value: &[u8]) -> StoreResult<()>;

    fn get_record(&self, tenant: Option<&str>, id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns whether a record was removed.
    fn delete_record(&self, tenant: Option<&str>, id: &str) -> StoreResult<bool>;

    fn insert_vector(&self, tenant: Option<&str>, id: &str, embedding: &[f32]) -> StoreResult<()>;

    fn delete_vector(&self, tenant: Option<&str>, id: &str) -> StoreResult<bool>;

    fn count_records(&self, tenant: Option<&str>) -> StoreResult<u64>;

    /// Bytes used: the file size when unscoped, stored value bytes otherwise.
    fn storage_bytes(&self, tenant: Option<&str>) -> StoreResult<u64>;

    /// Make every committed write durable in the primary file.
    fn checkpoint(&self) -> StoreResult<()>;

    /// Release the underlying file. Later operations fail with `Closed`.
    fn close(&self) -> StoreResult<()>;

    fn is_open(&self) -> bool;
}

// =============================================================================
// Key Helpers
// =============================================================================

/// Build the stored key for a record.
pub fn record_key(tenant: Option<&str>, id: &str) -> String {
    match tenant {
        Some(t) => format!("{t}/{id}"),
        None => id.to_string(),
    }
}

/// Half-open key range covering every record of `tenant` (`'0'` follows `'/'`).
fn tenant_range(tenant: &str) -> (String, String) {
    (format!("{tenant}/"), format!("{tenant}0"))
}

fn pack_vector(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// =============================================================================
// Redb Engine
// =============================================================================

/// Opens [`VaultStore`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedbEngine;

impl StorageEngine for RedbEngine {
    type Handle = VaultStore;

    fn open(&self, path: &Path) -> StoreResult<VaultStore> {
        VaultStore::open(path)
    }

    fn verify(&self, path: &Path) -> StoreResult<()> {
        let db = check_redb_file(path)?;
        let read_txn = db.begin_read()?;
        let _ = read_txn.open_table(RECORDS)?;
        let _ = read_txn.open_table(VECTORS)?;
        Ok(())
    }
}

/// Open an existing redb file and run its page-level integrity check.
///
/// A file copied from a live database carries an unclean-shutdown flag and is
/// repaired on open; that is accepted. Anything redb cannot repair is an
/// `Integrity` error. Returns the opened database so callers can inspect its
/// schema.
pub fn check_redb_file(path: &Path) -> StoreResult<Database> {
    let mut db = Database::open(path)
        .map_err(|e| StoreError::Integrity(format!("{}: {e}", path.display())))?;
    match db.check_integrity() {
        Ok(true) => Ok(db),
        Ok(false) => {
            tracing::debug!(path = %path.display(), "Store file was repaired during integrity check");
            Ok(db)
        }
        Err(e) => Err(StoreError::Integrity(format!("{}: {e}", path.display()))),
    }
}

/// Embedded per-tenant vault database.
pub struct VaultStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl VaultStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS)?;
            let _ = write_txn.open_table(VECTORS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            path: path.to_path_buf(),
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.db.read().map_err(|_| StoreError::Poisoned)?;
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed),
        }
    }

    fn insert_into(&self, table: BytesTable, key: &str, value: &[u8]) -> StoreResult<()> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut t = write_txn.open_table(table)?;
                t.insert(key, value)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn remove_from(&self, table: BytesTable, key: &str) -> StoreResult<bool> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let removed = {
                let mut t = write_txn.open_table(table)?;
                let existed = t.remove(key)?.is_some();
                existed
            };
            write_txn.commit()?;
            Ok(removed)
        })
    }

    fn scoped_value_bytes(&self, tenant: &str) -> StoreResult<u64> {
        let (start, end) = tenant_range(tenant);
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let mut total = 0u64;
            for def in [RECORDS, VECTORS] {
                let table = read_txn.open_table(def)?;
                for entry in table.range(start.as_str()..end.as_str())? {
                    let (key, value) = entry?;
                    total += (key.value().len() + value.value().len()) as u64;
                }
            }
            Ok(total)
        })
    }
}

impl StoreHandle for VaultStore {
    fn insert_record(&self, tenant: Option<&str>, id: &str, value: &[u8]) -> StoreResult<()> {
        self.insert_into(RECORDS, &record_key(tenant, id), value)
    }

    fn get_record(&self, tenant: Option<&str>, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = record_key(tenant, id);
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
        })
    }

    fn delete_record(&self, tenant: Option<&str>, id: &str) -> StoreResult<bool> {
        let key = record_key(tenant, id);
        // A record's embedding goes with it
        self.remove_from(VECTORS, &key)?;
        self.remove_from(RECORDS, &key)
    }

    fn insert_vector(&self, tenant: Option<&str>, id: &str, embedding: &[f32]) -> StoreResult<()> {
        self.insert_into(VECTORS, &record_key(tenant, id), &pack_vector(embedding))
    }

    fn delete_vector(&self, tenant: Option<&str>, id: &str) -> StoreResult<bool> {
        self.remove_from(VECTORS, &record_key(tenant, id))
    }

    fn count_records(&self, tenant: Option<&str>) -> StoreResult<u64> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            match tenant {
                None => Ok(table.len()?),
                Some(t) => {
                    let (start, end) = tenant_range(t);
                    let mut count = 0u64;
                    for entry in table.range(start.as_str()..end.as_str())? {
                        entry?;
                        count += 1;
                    }
                    Ok(count)
                }
            }
        })
    }

    fn storage_bytes(&self, tenant: Option<&str>) -> StoreResult<u64> {
        match tenant {
            None => {
                self.with_db(|_| Ok(()))?;
                Ok(std::fs::metadata(&self.path)?.len())
            }
            Some(t) => self.scoped_value_bytes(t),
        }
    }

    fn checkpoint(&self) -> StoreResult<()> {
        // An empty write transaction commits with immediate durability,
        // flushing everything before it to the primary file.
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            write_txn.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self.db.write().map_err(|_| StoreError::Poisoned)?;
        // Dropping the database releases its file lock
        guard.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.db.read().map(|g| g.is_some()).unwrap_or(false)
    }
}
