// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Persistent storage on embedded **redb** databases under `DATA_DIR`.
//!
//! ## Storage Layout
//!
//! ```text
//! /data/
//!   meta.db                      # tenant key records (shared)
//!   vault.db                     # shared mode: every tenant's content
//!   users/{tenant_id}/
//!     vault.db                   # isolated mode: one tenant's content
//!     vault.db.restore-staging   # only while a restore is verifying
//! ```
//!
//! ## Important Notes
//!
//! - Stores hold ciphertext for protected fields; encryption happens above
//!   this module, in `context`
//! - Open stores are owned by the [`StorageHandlePool`]; do not open tenant
//!   files directly
//! - Tenant ids are validated before any path is built from them

pub mod engine;
pub mod key_store;
pub mod paths;
pub mod pool;

pub use engine::{RedbEngine, StorageEngine, StoreError, StoreHandle, StoreResult, VaultStore};
pub use key_store::KeyStore;
pub use paths::StoragePaths;
pub use pool::{PoolConfig, PoolError, RestoreGuard, StorageHandlePool};
