// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared metadata store (`meta.db`) holding each tenant's wrapped DEK.
//!
//! ## Table Layout
//!
//! - `tenant_keys`: tenant_id → serialized [`EncryptedDekRecord`] (JSON)
//!
//! The store can be closed and reopened in place so a restore can swap the
//! file underneath it.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::engine::{check_redb_file, StoreError, StoreResult};
use crate::keys::EncryptedDekRecord;

/// tenant_id → EncryptedDekRecord JSON bytes.
const TENANT_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenant_keys");

/// Persistent per-tenant key records.
pub struct KeyStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").field("path", &self.path).finish()
    }
}

impl KeyStore {
    /// Open (or create) the metadata store at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Self::open_db(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            db: RwLock::new(Some(db)),
        })
    }

    fn open_db(path: &Path) -> StoreResult<Database> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TENANT_KEYS)?;
        }
        write_txn.commit()?;
        Ok(db)
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

    /// Insert or replace a tenant's key record.
    pub fn put(&self, tenant_id: &str, record: &EncryptedDekRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(TENANT_KEYS)?;
                table.insert(tenant_id, json.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    pub fn get(&self, tenant_id: &str) -> StoreResult<Option<EncryptedDekRecord>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TENANT_KEYS)?;
            match table.get(tenant_id)? {
                Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
                None => Ok(None),
            }
        })
    }

    /// Remove a tenant's key record (account deletion).
    pub fn delete(&self, tenant_id: &str) -> StoreResult<bool> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let removed = {
                let mut table = write_txn.open_table(TENANT_KEYS)?;
                let existed = table.remove(tenant_id)?.is_some();
                existed
            };
            write_txn.commit()?;
            Ok(removed)
        })
    }

    /// Every tenant with a key record, in key order.
    pub fn tenants(&self) -> StoreResult<Vec<String>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TENANT_KEYS)?;
            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                ids.push(key.value().to_string());
            }
            Ok(ids)
        })
    }

    /// Durably flush committed writes.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            write_txn.commit()?;
            Ok(())
        })
    }

    /// Release the file. Operations fail with `Closed` until [`Self::reopen`].
    pub fn close(&self) -> StoreResult<()> {
        let mut guard = self.db.write().map_err(|_| StoreError::Poisoned)?;
        guard.take();
        Ok(())
    }

    /// Reopen the file at the same path (after a restore replaced it).
    pub fn reopen(&self) -> StoreResult<()> {
        let mut guard = self.db.write().map_err(|_| StoreError::Poisoned)?;
        guard.take();
        *guard = Some(Self::open_db(&self.path)?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.db.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Integrity check for a metadata snapshot at rest.
    pub fn verify(path: &Path) -> StoreResult<()> {
        let db = check_redb_file(path)?;
        let read_txn = db.begin_read()?;
        let _ = read_txn.open_table(TENANT_KEYS)?;
        Ok(())
    }
}
