// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Short-lived cache of per-tenant request contexts.
//!
//! A context bundles everything a request needs to touch a tenant's vault:
//! the pooled storage handle, the tenant's resolved DEK (when a master secret
//! is configured) and the tier limits. Building one costs a pool lookup and
//! possibly an Argon2 derivation, so contexts are cached per
//! `tenant_id:team_id` for a few minutes.
//!
//! Call [`RequestContextCache::clear_cached_context`] whenever a tenant's
//! tier, key or account status changes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StorageMode;
use crate::crypto::{self, CryptoError, DataKey, EncryptedRecord, PlainRecord};
use crate::keys::{ClientKeyShare, EncryptedDekRecord, EncryptionMode, KeyError, KeyManager, MasterSecret};
use crate::storage::engine::{StorageEngine, StoreError, StoreHandle};
use crate::storage::paths::is_valid_tenant_id;
use crate::storage::pool::{PoolError, StorageHandlePool};

/// Default time-to-live of a cached context.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default number of cached contexts.
pub const DEFAULT_CONTEXT_CAPACITY: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("tenant {0} has no key record")]
    MissingKeyRecord(String),

    #[error("encryption is not configured")]
    EncryptionDisabled,

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type ContextResult<T> = Result<T, ContextError>;

// =============================================================================
// Tenant Inputs
// =============================================================================

/// Per-tier quotas. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_entries: Option<u64>,
    pub max_storage_bytes: Option<u64>,
}

impl TierLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Tier name → limits, supplied by the billing layer.
pub type TierLimitsLookup = Arc<dyn Fn(&str) -> TierLimits + Send + Sync>;

/// What the request layer knows about the caller's tenant.
#[derive(Debug, Clone)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub tier: String,
    pub key_record: Option<EncryptedDekRecord>,
}

/// Current usage against the tenant's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub entries: u64,
    pub storage_bytes: u64,
    pub limits: TierLimits,
}

impl LimitStatus {
    pub fn entries_exceeded(&self) -> bool {
        self.limits.max_entries.is_some_and(|max| self.entries >= max)
    }

    pub fn storage_exceeded(&self) -> bool {
        self.limits
            .max_storage_bytes
            .is_some_and(|max| self.storage_bytes >= max)
    }

    /// Whether one more entry may be written.
    pub fn within_limits(&self) -> bool {
        !self.entries_exceeded() && !self.storage_exceeded()
    }
}

/// Row format written through a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
enum StoredEntry {
    Encrypted(EncryptedRecord),
    Plain(PlainRecord),
}

// =============================================================================
// RequestContext
// =============================================================================

/// Everything one request needs to work with one tenant's vault.
pub struct RequestContext<H> {
    tenant_id: String,
    team_id: Option<String>,
    tier: String,
    mode: StorageMode,
    handle: Arc<H>,
    cipher: Option<DataKey>,
    encryption_mode: Option<EncryptionMode>,
    limits: TierLimits,
}

impl<H> std::fmt::Debug for RequestContext<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("tenant_id", &self.tenant_id)
            .field("team_id", &self.team_id)
            .field("tier", &self.tier)
            .field("mode", &self.mode)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl<H: StoreHandle> RequestContext<H> {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Tenant filter for queries: only needed when tenants share a file.
    fn scope(&self) -> Option<&str> {
        match self.mode {
            StorageMode::Isolated => None,
            StorageMode::Shared => Some(&self.tenant_id),
        }
    }

    fn cipher(&self) -> ContextResult<&DataKey> {
        self.cipher.as_ref().ok_or(ContextError::EncryptionDisabled)
    }

    /// Encrypt a record's protected fields under the tenant's DEK.
    pub fn encrypt(&self, record: &PlainRecord) -> ContextResult<EncryptedRecord> {
        Ok(crypto::encrypt_record(record, self.cipher()?)?)
    }

    /// Decrypt a stored row under the tenant's DEK.
    pub fn decrypt(&self, row: &EncryptedRecord) -> ContextResult<PlainRecord> {
        Ok(crypto::decrypt_record(row, self.cipher()?)?)
    }

    /// Count the tenant's entries and bytes and compare with the tier.
    pub fn check_limits(&self) -> ContextResult<LimitStatus> {
        let scope = self.scope();
        Ok(LimitStatus {
            entries: self.handle.count_records(scope)?,
            storage_bytes: self.handle.storage_bytes(scope)?,
            limits: self.limits,
        })
    }

    /// Store a record, encrypted when a DEK is available.
    pub fn put_entry(&self, id: &str, record: &PlainRecord) -> ContextResult<()> {
        let entry = match &self.cipher {
            Some(key) => StoredEntry::Encrypted(crypto::encrypt_record(record, key)?),
            None => StoredEntry::Plain(record.clone()),
        };
        let bytes = serde_json::to_vec(&entry).map_err(StoreError::from)?;
        self.handle.insert_record(self.scope(), id, &bytes)?;
        Ok(())
    }

    /// Load and decrypt a record.
    pub fn get_entry(&self, id: &str) -> ContextResult<Option<PlainRecord>> {
        let Some(bytes) = self.handle.get_record(self.scope(), id)? else {
            return Ok(None);
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        match entry {
            StoredEntry::Encrypted(row) => Ok(Some(self.decrypt(&row)?)),
            StoredEntry::Plain(record) => Ok(Some(record)),
        }
    }

    pub fn delete_entry(&self, id: &str) -> ContextResult<bool> {
        Ok(self.handle.delete_record(self.scope(), id)?)
    }

    pub fn put_embedding(&self, id: &str, embedding: &[f32]) -> ContextResult<()> {
        Ok(self.handle.insert_vector(self.scope(), id, embedding)?)
    }

    pub fn delete_embedding(&self, id: &str) -> ContextResult<bool> {
        Ok(self.handle.delete_vector(self.scope(), id)?)
    }
}

// =============================================================================
// RequestContextCache
// =============================================================================

/// Cached entry: context + insertion timestamp.
struct CacheEntry<H> {
    context: Arc<RequestContext<H>>,
    inserted_at: Instant,
}

/// Cached contexts and the invalidation generation.
///
/// A context built across a `clear_cached_context` call is returned to its
/// caller but never cached.
struct ContextSlots<H> {
    entries: LruCache<String, CacheEntry<H>>,
    generation: u64,
}

/// In-process LRU cache of request contexts with a fixed TTL.
pub struct RequestContextCache<E: StorageEngine> {
    pool: Arc<StorageHandlePool<E>>,
    keys: Arc<KeyManager>,
    mode: StorageMode,
    tier_limits: TierLimitsLookup,
    cache: Mutex<ContextSlots<E::Handle>>,
    ttl: Duration,
}

fn cache_key(tenant_id: &str, team_id: Option<&str>) -> String {
    format!("{tenant_id}:{}", team_id.unwrap_or(""))
}

impl<E: StorageEngine> RequestContextCache<E> {
    /// Create a new cache with the given capacity and TTL.
    pub fn new(
        pool: Arc<StorageHandlePool<E>>,
        keys: Arc<KeyManager>,
        mode: StorageMode,
        tier_limits: TierLimitsLookup,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            pool,
            keys,
            mode,
            tier_limits,
            cache: Mutex::new(ContextSlots {
                entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
                generation: 0,
            }),
            ttl,
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Return a live cached context or build and cache a fresh one.
    ///
    /// A cached split-authority context is only served to a caller that
    /// presents the matching client share.
    pub async fn get_cached_context(
        &self,
        tenant: &TenantProfile,
        master: Option<&MasterSecret>,
        client_share: Option<&ClientKeyShare>,
        team_id: Option<&str>,
    ) -> ContextResult<Arc<RequestContext<E::Handle>>> {
        let key = cache_key(&tenant.tenant_id, team_id);

        let generation = match self.lookup(&key) {
            Ok(context) => {
                if context.encryption_mode == Some(EncryptionMode::SplitAuthority) {
                    let record = tenant
                        .key_record
                        .as_ref()
                        .ok_or_else(|| ContextError::MissingKeyRecord(tenant.tenant_id.clone()))?;
                    let share = client_share.ok_or(KeyError::MissingSecretShare)?;
                    self.keys.verify_share(record, share)?;
                }
                return Ok(context);
            }
            Err(generation) => generation,
        };

        let context = Arc::new(self.build(tenant, master, client_share, team_id).await?);
        self.store(generation, key, Arc::clone(&context));
        Ok(context)
    }

    /// Unexpired context whose handle is still open, or the generation a
    /// fresh build starts under.
    fn lookup(&self, key: &str) -> Result<Arc<RequestContext<E::Handle>>, Option<u64>> {
        let Ok(mut cache) = self.cache.lock() else {
            return Err(None);
        };
        if let Some(entry) = cache.entries.get(key) {
            if entry.inserted_at.elapsed() < self.ttl && entry.context.handle.is_open() {
                return Ok(Arc::clone(&entry.context));
            }
            // Expired or its handle was evicted; drop it
            cache.entries.pop(key);
        }
        Err(Some(cache.generation))
    }

    fn store(
        &self,
        generation: Option<u64>,
        key: String,
        context: Arc<RequestContext<E::Handle>>,
    ) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if generation != Some(cache.generation) {
            debug!(key = %key, "Context cleared while building; not caching");
            return;
        }
        cache.entries.put(
            key,
            CacheEntry {
                context,
                inserted_at: Instant::now(),
            },
        );
    }

    async fn build(
        &self,
        tenant: &TenantProfile,
        master: Option<&MasterSecret>,
        client_share: Option<&ClientKeyShare>,
        team_id: Option<&str>,
    ) -> ContextResult<RequestContext<E::Handle>> {
        let tenant_id = tenant.tenant_id.as_str();
        let handle = match self.mode {
            StorageMode::Isolated => self.pool.get(tenant_id).await?,
            StorageMode::Shared => {
                if !is_valid_tenant_id(tenant_id) {
                    return Err(PoolError::InvalidTenantId(tenant_id.to_string()).into());
                }
                self.pool.get_shared().await?
            }
        };

        let (cipher, encryption_mode) = match master {
            Some(master) => {
                let record = tenant
                    .key_record
                    .clone()
                    .ok_or_else(|| ContextError::MissingKeyRecord(tenant_id.to_string()))?;
                let mode = record.encryption_mode;
                let keys = Arc::clone(&self.keys);
                let id = tenant_id.to_string();
                let master = master.clone();
                let share = client_share.cloned();
                let dek = tokio::task::spawn_blocking(move || {
                    keys.resolve_dek(&id, &record, &master, share.as_ref())
                })
                .await
                .map_err(|e| ContextError::Task(e.to_string()))??;
                (Some(dek), Some(mode))
            }
            None => (None, None),
        };

        debug!(
            tenant_id = %tenant_id,
            team_id = ?team_id,
            encrypted = cipher.is_some(),
            "Built request context"
        );

        Ok(RequestContext {
            tenant_id: tenant_id.to_string(),
            team_id: team_id.map(str::to_string),
            tier: tenant.tier.clone(),
            mode: self.mode,
            handle,
            cipher,
            encryption_mode,
            limits: (self.tier_limits)(&tenant.tier),
        })
    }

    /// Drop every context of one tenant, or the whole cache.
    pub fn clear_cached_context(&self, tenant_id: Option<&str>) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        cache.generation = cache.generation.wrapping_add(1);
        match tenant_id {
            Some(id) => {
                let prefix = format!("{id}:");
                let stale: Vec<String> = cache
                    .entries
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in stale {
                    cache.entries.pop(&key);
                }
            }
            None => cache.entries.clear(),
        }
    }

    /// Number of cached contexts (including not-yet-purged expired ones).
    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
