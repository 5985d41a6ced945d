// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Service root: one instance of every vault service, created at startup and
//! shared by reference with every request path.

use std::sync::Arc;

use tracing::info;

use crate::backup::{BackupConfig, BackupCoordinator, ColdStorage, FsColdStorage};
use crate::config::VaultConfig;
use crate::context::{
    RequestContext, RequestContextCache, TenantProfile, TierLimits, TierLimitsLookup,
    DEFAULT_CONTEXT_CAPACITY,
};
use crate::error::{VaultError, VaultResult};
use crate::keys::{
    ClientKeyShare, EncryptionMode, KdfParams, KeyManager, DEFAULT_DEK_CACHE_CAPACITY,
};
use crate::storage::engine::{RedbEngine, VaultStore};
use crate::storage::key_store::KeyStore;
use crate::storage::paths::{is_valid_tenant_id, StoragePaths};
use crate::storage::pool::{PoolConfig, PoolError, StorageHandlePool};

/// Collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct ServiceOptions {
    /// Tier name → limits (billing is external).
    pub tier_limits: TierLimitsLookup,
    pub kdf_params: KdfParams,
    /// Overrides the filesystem cold storage built from `BACKUP_DIR`.
    pub cold_storage: Option<Arc<dyn ColdStorage>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            tier_limits: Arc::new(|_: &str| TierLimits::unlimited()),
            kdf_params: KdfParams::default(),
            cold_storage: None,
        }
    }
}

pub struct VaultServices {
    config: VaultConfig,
    key_store: Arc<KeyStore>,
    keys: Arc<KeyManager>,
    pool: Arc<StorageHandlePool<RedbEngine>>,
    contexts: RequestContextCache<RedbEngine>,
    backups: Arc<BackupCoordinator<RedbEngine>>,
}

impl VaultServices {
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        Self::open_with(config, ServiceOptions::default())
    }

    /// Build every service. Opens (or creates) `meta.db`.
    pub fn open_with(config: VaultConfig, options: ServiceOptions) -> VaultResult<Self> {
        let paths = StoragePaths::new(&config.data_dir);
        let key_store = Arc::new(KeyStore::open(&paths.meta_db())?);
        let keys = Arc::new(KeyManager::new(options.kdf_params, DEFAULT_DEK_CACHE_CAPACITY));

        let pool = Arc::new(StorageHandlePool::new(
            RedbEngine,
            paths,
            PoolConfig {
                capacity: config.pool_max_handles,
                idle_timeout: config.pool_idle_timeout,
                sweep_interval: config.pool_sweep_interval,
            },
        ));

        let contexts = RequestContextCache::new(
            Arc::clone(&pool),
            Arc::clone(&keys),
            config.storage_mode,
            options.tier_limits,
            DEFAULT_CONTEXT_CAPACITY,
            config.context_ttl,
        );

        let cold = options.cold_storage.or_else(|| {
            config
                .backup_dir
                .as_ref()
                .map(|dir| Arc::new(FsColdStorage::new(dir)) as Arc<dyn ColdStorage>)
        });
        let backups = Arc::new(BackupCoordinator::new(
            Arc::clone(&pool),
            Arc::clone(&key_store),
            cold,
            BackupConfig {
                mode: config.storage_mode,
                interval: config.backup_interval,
                retention_days: config.backup_retention_days,
                concurrency: config.backup_concurrency,
            },
        ));

        info!(
            data_dir = %config.data_dir.display(),
            mode = %config.storage_mode,
            encryption = config.encryption_enabled(),
            backups = backups.is_configured(),
            "Vault services initialized"
        );

        Ok(Self {
            config,
            key_store,
            keys,
            pool,
            contexts,
            backups,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn pool(&self) -> &Arc<StorageHandlePool<RedbEngine>> {
        &self.pool
    }

    pub fn contexts(&self) -> &RequestContextCache<RedbEngine> {
        &self.contexts
    }

    pub fn backups(&self) -> &Arc<BackupCoordinator<RedbEngine>> {
        &self.backups
    }

    /// Create and persist a tenant's DEK.
    ///
    /// Returns the client share for split-authority tenants. It is not stored
    /// anywhere and cannot be recovered.
    pub async fn provision_tenant(
        &self,
        tenant_id: &str,
        mode: EncryptionMode,
    ) -> VaultResult<Option<ClientKeyShare>> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(PoolError::InvalidTenantId(tenant_id.to_string()).into());
        }
        let master = self
            .config
            .master_secret
            .clone()
            .ok_or(VaultError::MasterSecretMissing)?;
        if self.key_store.get(tenant_id)?.is_some() {
            return Err(VaultError::AlreadyProvisioned(tenant_id.to_string()));
        }

        let keys = Arc::clone(&self.keys);
        let (record, share) = tokio::task::spawn_blocking(move || match mode {
            EncryptionMode::Legacy => keys.generate_dek(&master).map(|g| (g.record, None)),
            EncryptionMode::SplitAuthority => keys
                .generate_dek_split_authority(&master)
                .map(|g| (g.record, Some(g.client_share))),
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))??;

        self.key_store.put(tenant_id, &record)?;
        info!(tenant_id = %tenant_id, mode = %mode, "Provisioned tenant key");
        Ok(share)
    }

    /// Request context for a tenant, loading its key record from `meta.db`.
    pub async fn context(
        &self,
        tenant_id: &str,
        tier: &str,
        client_share: Option<&ClientKeyShare>,
        team_id: Option<&str>,
    ) -> VaultResult<Arc<RequestContext<VaultStore>>> {
        let profile = TenantProfile {
            tenant_id: tenant_id.to_string(),
            tier: tier.to_string(),
            key_record: self.key_store.get(tenant_id)?,
        };
        Ok(self
            .contexts
            .get_cached_context(
                &profile,
                self.config.master_secret.as_ref(),
                client_share,
                team_id,
            )
            .await?)
    }

    /// Call after a tenant's tier, key or account status changes.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        self.contexts.clear_cached_context(Some(tenant_id));
        self.keys.invalidate(Some(tenant_id));
    }

    pub async fn restore_tenant(&self, tenant_id: &str, timestamp: &str) -> VaultResult<()> {
        self.backups.restore_tenant(tenant_id, timestamp).await?;
        self.invalidate_tenant(tenant_id);
        Ok(())
    }

    pub async fn restore_shared(&self, timestamp: &str) -> VaultResult<()> {
        self.backups.restore_shared(timestamp).await?;
        self.contexts.clear_cached_context(None);
        Ok(())
    }

    /// Restore `meta.db`; every cached key and context is dropped.
    pub async fn restore_meta(&self, timestamp: &str) -> VaultResult<()> {
        self.backups.restore_meta(timestamp).await?;
        self.contexts.clear_cached_context(None);
        self.keys.invalidate(None);
        Ok(())
    }

    /// Start the idle sweep and the backup schedule.
    pub fn start_background_tasks(&self) {
        self.pool.start_sweeper();
        self.backups.schedule_backups();
    }

    /// Stop background tasks, checkpoint and close every store.
    pub async fn shutdown(&self) -> VaultResult<()> {
        self.backups.stop_schedule().await;
        self.contexts.clear_cached_context(None);
        let closed = self.pool.close_all().await?;

        let key_store = Arc::clone(&self.key_store);
        tokio::task::spawn_blocking(move || key_store.checkpoint())
            .await
            .map_err(|e| VaultError::Task(e.to_string()))??;

        info!(closed, "Vault services shut down");
        Ok(())
    }
}
