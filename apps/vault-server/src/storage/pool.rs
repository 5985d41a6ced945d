// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bounded LRU pool of per-tenant storage handles.
//!
//! ## Guarantees
//!
//! - At most `capacity` open handles, counting opens in flight. The least
//!   recently used entry is closed before a new file is opened.
//! - At most one live handle per tenant. Concurrent first `get`s for the same
//!   tenant wait on a per-tenant creation gate and share one opened handle.
//! - Every handle leaving the pool is checkpointed, then closed, while its
//!   key's creation gate is held. A `get` racing the eviction reopens only
//!   after the close. A failed checkpoint is logged and eviction proceeds.
//! - While a restore holds a [`RestoreGuard`] for a tenant, `get` for that
//!   tenant fails with [`PoolError::RestoreInProgress`] instead of reopening
//!   the file being replaced.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, info, warn};

use super::engine::{StorageEngine, StoreError, StoreHandle};
use super::paths::{is_valid_tenant_id, StoragePaths};
use crate::background::BackgroundTask;

/// Pool key of the single shared-mode handle. Not a valid tenant id.
pub const SHARED_KEY: &str = "#shared";

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error("restore in progress for {0}")]
    RestoreInProgress(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error("pool lock poisoned")]
    Poisoned,
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Pool sizing and idle policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PoolEntry<H> {
    handle: Arc<H>,
    last_access: Instant,
}

/// Live entries plus opens that already hold a capacity slot.
struct Slots<H> {
    entries: LruCache<String, PoolEntry<H>>,
    opening: usize,
}

/// Bounded pool of open storage handles, one per tenant.
pub struct StorageHandlePool<E: StorageEngine> {
    engine: Arc<E>,
    paths: StoragePaths,
    config: PoolConfig,
    slots: Mutex<Slots<E::Handle>>,
    slot_freed: tokio::sync::Notify,
    creating: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    restoring: Mutex<HashSet<String>>,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl<E: StorageEngine> StorageHandlePool<E> {
    pub fn new(engine: E, paths: StoragePaths, config: PoolConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            paths,
            config,
            // Capacity is enforced by `reserve_slot`; the cache itself never drops a handle
            slots: Mutex::new(Slots {
                entries: LruCache::unbounded(),
                opening: 0,
            }),
            slot_freed: tokio::sync::Notify::new(),
            creating: Mutex::new(HashMap::new()),
            restoring: Mutex::new(HashSet::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Handle for a tenant's isolated vault, opening it if needed.
    pub async fn get(&self, tenant_id: &str) -> PoolResult<Arc<E::Handle>> {
        validate(tenant_id)?;
        self.acquire(tenant_id, self.paths.tenant_vault(tenant_id))
            .await
    }

    /// Handle for the single vault shared by all tenants.
    pub async fn get_shared(&self) -> PoolResult<Arc<E::Handle>> {
        self.acquire(SHARED_KEY, self.paths.shared_vault()).await
    }

    async fn acquire(&self, key: &str, path: PathBuf) -> PoolResult<Arc<E::Handle>> {
        self.ensure_not_restoring(key)?;
        if let Some(handle) = self.touch(key)? {
            return Ok(handle);
        }

        let gate = self.creation_gate(key)?;
        let result = self.create_entry(key, path, &gate).await;
        self.release_gate(key, gate);
        result
    }

    async fn create_entry(
        &self,
        key: &str,
        path: PathBuf,
        gate: &tokio::sync::Mutex<()>,
    ) -> PoolResult<Arc<E::Handle>> {
        let _creating = gate.lock().await;

        // Another caller may have opened it while we waited on the gate
        if let Some(handle) = self.touch(key)? {
            return Ok(handle);
        }
        self.ensure_not_restoring(key)?;
        self.reserve_slot().await?;

        let engine = Arc::clone(&self.engine);
        let opened = tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            engine.open(&path)
        })
        .await
        .map_err(|e| PoolError::Task(e.to_string()))
        .and_then(|r| r.map_err(PoolError::from));

        let result = {
            let mut slots = self.lock_slots()?;
            slots.opening = slots.opening.saturating_sub(1);
            opened.map(|handle| {
                let handle = Arc::new(handle);
                slots.entries.put(
                    key.to_string(),
                    PoolEntry {
                        handle: Arc::clone(&handle),
                        last_access: Instant::now(),
                    },
                );
                handle
            })
        };
        self.slot_freed.notify_waiters();

        if result.is_ok() {
            info!(tenant_id = %key, "Opened storage handle");
        }
        result
    }

    /// Claim a capacity slot for a new open, retiring least recently used
    /// handles until one is free.
    async fn reserve_slot(&self) -> PoolResult<()> {
        let capacity = self.config.capacity.max(1);
        loop {
            let freed = self.slot_freed.notified();
            let victim = {
                let mut slots = self.lock_slots()?;
                if slots.entries.len() + slots.opening < capacity {
                    slots.opening += 1;
                    return Ok(());
                }
                slots.entries.peek_lru().map(|(k, _)| k.clone())
            };
            match victim {
                Some(victim) => {
                    self.retire_key(&victim, "capacity", |_| true).await?;
                }
                // Every slot belongs to an open still in flight
                None => freed.await,
            }
        }
    }

    /// Checkpoint, close and remove a tenant's handle. No-op when absent.
    pub async fn evict(&self, tenant_id: &str) -> PoolResult<bool> {
        self.evict_key(tenant_id).await
    }

    /// Checkpoint, close and remove the shared-mode handle.
    pub async fn evict_shared(&self) -> PoolResult<bool> {
        self.evict_key(SHARED_KEY).await
    }

    async fn evict_key(&self, key: &str) -> PoolResult<bool> {
        self.retire_key(key, "explicit", |_| true).await
    }

    /// Remove and close one entry while holding its creation gate, so no
    /// open for the same key can start before the close finishes.
    async fn retire_key<F>(
        &self,
        key: &str,
        reason: &'static str,
        should_retire: F,
    ) -> PoolResult<bool>
    where
        F: Fn(&PoolEntry<E::Handle>) -> bool,
    {
        let gate = self.creation_gate(key)?;
        let result = self.retire_gated(key, reason, should_retire, &gate).await;
        self.release_gate(key, gate);
        result
    }

    async fn retire_gated<F>(
        &self,
        key: &str,
        reason: &'static str,
        should_retire: F,
        gate: &tokio::sync::Mutex<()>,
    ) -> PoolResult<bool>
    where
        F: Fn(&PoolEntry<E::Handle>) -> bool,
    {
        let _retiring = gate.lock().await;
        let entry = {
            let mut slots = self.lock_slots()?;
            let matches = slots.entries.peek(key).is_some_and(&should_retire);
            if matches {
                slots.entries.pop(key)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            return Ok(false);
        };

        retire_blocking(key.to_string(), entry, reason).await;
        self.slot_freed.notify_waiters();
        Ok(true)
    }

    /// Flush a live handle without evicting it. Returns `false` when the
    /// tenant has no live handle.
    pub async fn checkpoint(&self, tenant_id: &str) -> PoolResult<bool> {
        self.checkpoint_key(tenant_id).await
    }

    pub async fn checkpoint_shared(&self) -> PoolResult<bool> {
        self.checkpoint_key(SHARED_KEY).await
    }

    async fn checkpoint_key(&self, key: &str) -> PoolResult<bool> {
        let handle = self
            .lock_slots()?
            .entries
            .peek(key)
            .map(|e| Arc::clone(&e.handle));
        let Some(handle) = handle else {
            return Ok(false);
        };
        tokio::task::spawn_blocking(move || handle.checkpoint())
            .await
            .map_err(|e| PoolError::Task(e.to_string()))??;
        Ok(true)
    }

    /// Evict every entry idle for longer than the configured timeout.
    ///
    /// Returns the evicted tenant ids.
    pub async fn sweep_idle(&self) -> PoolResult<Vec<String>> {
        let idle_timeout = self.config.idle_timeout;
        let is_idle = |e: &PoolEntry<E::Handle>| e.last_access.elapsed() > idle_timeout;
        let stale: Vec<String> = self
            .lock_slots()?
            .entries
            .iter()
            .filter(|&(_, e)| is_idle(e))
            .map(|(k, _)| k.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            // A request may have touched it since the scan
            if self.retire_key(&key, "idle", is_idle).await? {
                evicted.push(key);
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Swept idle storage handles");
        }
        Ok(evicted)
    }

    /// Start the periodic idle sweep. Replaces any running sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = BackgroundTask::spawn_periodic(
            "pool-idle-sweep",
            self.config.sweep_interval,
            false,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(pool) = weak.upgrade() else {
                        return false;
                    };
                    if let Err(e) = pool.sweep_idle().await {
                        warn!(error = %e, "Idle sweep failed");
                    }
                    true
                }
            },
        );

        if let Ok(mut sweeper) = self.sweeper.lock() {
            // The replaced task is cancelled on drop
            *sweeper = Some(task);
        }
    }

    /// Stop the sweeper and evict every live handle (process shutdown).
    pub async fn close_all(&self) -> PoolResult<usize> {
        let sweeper = self.sweeper.lock().map_err(|_| PoolError::Poisoned)?.take();
        if let Some(task) = sweeper {
            task.shutdown().await;
        }

        let keys: Vec<String> = self
            .lock_slots()?
            .entries
            .iter()
            .rev()
            .map(|(k, _)| k.clone())
            .collect();
        let mut count = 0;
        for key in keys {
            if self.retire_key(&key, "shutdown", |_| true).await? {
                count += 1;
            }
        }
        info!(count, "Closed all storage handles");
        Ok(count)
    }

    /// Mark a tenant as being restored and evict its live handle.
    ///
    /// Opens for the tenant fail until the returned guard is dropped.
    pub async fn begin_restore(&self, tenant_id: &str) -> PoolResult<RestoreGuard<'_, E>> {
        validate(tenant_id)?;
        self.begin_restore_key(tenant_id).await
    }

    pub async fn begin_restore_shared(&self) -> PoolResult<RestoreGuard<'_, E>> {
        self.begin_restore_key(SHARED_KEY).await
    }

    async fn begin_restore_key(&self, key: &str) -> PoolResult<RestoreGuard<'_, E>> {
        {
            let mut restoring = self.restoring.lock().map_err(|_| PoolError::Poisoned)?;
            if !restoring.insert(key.to_string()) {
                return Err(PoolError::RestoreInProgress(key.to_string()));
            }
        }
        let guard = RestoreGuard {
            pool: self,
            key: key.to_string(),
        };

        // Eviction waits on the creation gate, so an in-flight open lands first
        self.evict_key(key).await?;
        Ok(guard)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the tenant has a live handle. Does not affect recency.
    pub fn has(&self, tenant_id: &str) -> bool {
        self.slots
            .lock()
            .map(|s| s.entries.contains(tenant_id))
            .unwrap_or(false)
    }

    /// Last recorded access of a tenant's handle.
    pub fn last_access(&self, tenant_id: &str) -> Option<Instant> {
        self.slots
            .lock()
            .ok()?
            .entries
            .peek(tenant_id)
            .map(|e| e.last_access)
    }

    /// Live tenant ids, most recently used first.
    pub fn tenants(&self) -> Vec<String> {
        self.slots
            .lock()
            .map(|s| s.entries.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    // ========== Internals ==========

    fn lock_slots(&self) -> PoolResult<MutexGuard<'_, Slots<E::Handle>>> {
        self.slots.lock().map_err(|_| PoolError::Poisoned)
    }

    /// Refresh recency of an existing entry and return its handle.
    fn touch(&self, key: &str) -> PoolResult<Option<Arc<E::Handle>>> {
        let mut slots = self.lock_slots()?;
        Ok(slots.entries.get_mut(key).map(|entry| {
            entry.last_access = Instant::now();
            Arc::clone(&entry.handle)
        }))
    }

    fn ensure_not_restoring(&self, key: &str) -> PoolResult<()> {
        let restoring = self.restoring.lock().map_err(|_| PoolError::Poisoned)?;
        if restoring.contains(key) {
            return Err(PoolError::RestoreInProgress(key.to_string()));
        }
        Ok(())
    }

    fn creation_gate(&self, key: &str) -> PoolResult<Arc<tokio::sync::Mutex<()>>> {
        let mut creating = self.creating.lock().map_err(|_| PoolError::Poisoned)?;
        Ok(Arc::clone(
            creating
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        ))
    }

    fn release_gate(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut creating) = self.creating.lock() {
            // Only the map and this caller still reference it: nobody waits
            if Arc::strong_count(&gate) <= 2 {
                creating.remove(key);
            }
        }
    }
}

fn validate(tenant_id: &str) -> PoolResult<()> {
    if is_valid_tenant_id(tenant_id) {
        Ok(())
    } else {
        Err(PoolError::InvalidTenantId(tenant_id.to_string()))
    }
}

/// Checkpoint then close, off the async executor.
async fn retire_blocking<H: StoreHandle>(key: String, entry: PoolEntry<H>, reason: &'static str) {
    let task_key = key.clone();
    let result = tokio::task::spawn_blocking(move || retire(&task_key, entry, reason)).await;
    if let Err(e) = result {
        warn!(tenant_id = %key, error = %e, "Eviction task failed");
    }
}

fn retire<H: StoreHandle>(key: &str, entry: PoolEntry<H>, reason: &str) {
    if let Err(e) = entry.handle.checkpoint() {
        warn!(tenant_id = %key, error = %e, "Checkpoint before close failed");
    }
    if let Err(e) = entry.handle.close() {
        warn!(tenant_id = %key, error = %e, "Closing storage handle failed");
    }
    debug!(
        tenant_id = %key,
        reason,
        idle_ms = entry.last_access.elapsed().as_millis() as u64,
        "Evicted storage handle"
    );
}

/// Blocks opens for one pool key while a restore replaces its file.
pub struct RestoreGuard<'a, E: StorageEngine> {
    pool: &'a StorageHandlePool<E>,
    key: String,
}

impl<E: StorageEngine> RestoreGuard<'_, E> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<E: StorageEngine> Drop for RestoreGuard<'_, E> {
    fn drop(&mut self) {
        if let Ok(mut restoring) = self.pool.restoring.lock() {
            restoring.remove(&self.key);
        }
    }
}
