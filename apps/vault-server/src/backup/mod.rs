// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Backup and Restore
//!
//! Snapshots every store file to cold storage, prunes snapshots past the
//! retention window and restores a snapshot only after it passes an
//! integrity check.
//!
//! ## Key Layout
//!
//! ```text
//! backups/{YYYY-MM-DD}/meta-{ts}.db                   # key records
//! backups/{YYYY-MM-DD}/users/{tenant_id}/vault-{ts}.db  # isolated mode
//! backups/{YYYY-MM-DD}/vault-{ts}.db                  # shared mode
//! ```
//!
//! `ts` is `YYYY-MM-DDTHH-MM-SS-mmmZ` (UTC); its first ten characters are the
//! date folder.
//!
//! ## Run Phases
//!
//! `Idle → Checkpointing → Snapshotting → Pruning → Idle`. A failed tenant
//! upload is recorded in the [`BackupReport`] and never aborts its siblings.
//!
//! ## Restore
//!
//! The snapshot is downloaded, the target's pool handle is evicted and opens
//! are blocked, the bytes go to a staging file next to the destination and the
//! staging file is verified. Only a verified file is renamed over the
//! destination; otherwise the staging file is removed and the destination is
//! left as it was.

pub mod cold_storage;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::background::BackgroundTask;
use crate::config::StorageMode;
use crate::storage::engine::{StorageEngine, StoreError};
use crate::storage::key_store::KeyStore;
use crate::storage::paths::{is_valid_tenant_id, staging_path, StoragePaths};
use crate::storage::pool::{PoolError, StorageHandlePool};

pub use cold_storage::{
    list_all, ColdStorage, ColdStorageError, FsColdStorage, ListPage, ObjectInfo,
    MAX_DELETE_BATCH,
};

/// Root prefix of every snapshot object.
pub const BACKUP_PREFIX: &str = "backups/";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("cold storage is not configured")]
    ConfigurationMissing,

    #[error("snapshot failed integrity check: {0}")]
    Integrity(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid snapshot timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error(transparent)]
    ColdStorage(#[from] ColdStorageError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type BackupResult<T> = Result<T, BackupError>;

/// Scheduling and fan-out policy.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub mode: StorageMode,
    pub interval: Duration,
    pub retention_days: u32,
    pub concurrency: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Isolated,
            interval: Duration::from_secs(24 * 3600),
            retention_days: 30,
            concurrency: 5,
        }
    }
}

/// Current phase of a backup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    #[default]
    Idle,
    Checkpointing,
    Snapshotting,
    Pruning,
}

/// One store that could not be snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFailure {
    pub target: String,
    pub error: String,
}

/// Outcome of one [`BackupCoordinator::run_backup`] call.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: Uuid,
    pub timestamp: String,
    /// Key of the metadata snapshot, when it was uploaded.
    pub meta_key: Option<String>,
    /// Keys of every uploaded store snapshot (metadata excluded).
    pub uploaded: Vec<String>,
    pub failures: Vec<BackupFailure>,
    /// Nothing was attempted because cold storage is not configured.
    pub skipped: bool,
}

impl BackupReport {
    fn new(timestamp: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp,
            meta_key: None,
            uploaded: Vec::new(),
            failures: Vec::new(),
            skipped: false,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub scanned: usize,
    pub deleted: usize,
    /// Objects whose key carries no parseable date; always kept.
    pub unparseable: usize,
    pub failed_batches: usize,
    pub skipped: bool,
}

/// Which store a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTarget<'a> {
    Meta,
    Shared,
    Tenant(&'a str),
}

impl SnapshotTarget<'_> {
    /// Cold storage key of this target's snapshot at `ts`.
    pub fn key(&self, ts: &str) -> String {
        let date = ts.get(..10).unwrap_or(ts);
        match self {
            Self::Meta => format!("{BACKUP_PREFIX}{date}/meta-{ts}.db"),
            Self::Shared => format!("{BACKUP_PREFIX}{date}/vault-{ts}.db"),
            Self::Tenant(id) => format!("{BACKUP_PREFIX}{date}/users/{id}/vault-{ts}.db"),
        }
    }

    /// Timestamp of `key` when it is a snapshot of this target.
    fn timestamp_of<'k>(&self, key: &'k str) -> Option<&'k str> {
        let rest = key.strip_prefix(BACKUP_PREFIX)?;
        let (date, name) = rest.split_once('/')?;
        let ts = match self {
            Self::Meta => name.strip_prefix("meta-")?.strip_suffix(".db")?,
            Self::Shared => name.strip_prefix("vault-")?.strip_suffix(".db")?,
            Self::Tenant(id) => name
                .strip_prefix("users/")?
                .strip_prefix(*id)?
                .strip_prefix("/vault-")?
                .strip_suffix(".db")?,
        };
        (parse_timestamp(ts).is_some() && ts.starts_with(date)).then_some(ts)
    }
}

impl std::fmt::Display for SnapshotTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Meta => f.write_str("meta"),
            Self::Shared => f.write_str("shared"),
            Self::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

/// Render a snapshot timestamp (`2026-10-16T09-30-00-123Z`).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()
}

/// Date folder of a snapshot key (`backups/{date}/…`).
pub fn key_date(key: &str) -> Option<NaiveDate> {
    let rest = key.strip_prefix(BACKUP_PREFIX)?;
    let (date, _) = rest.split_once('/')?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

// =============================================================================
// Coordinator
// =============================================================================

/// Snapshots, prunes and restores store files.
pub struct BackupCoordinator<E: StorageEngine> {
    paths: StoragePaths,
    pool: Arc<StorageHandlePool<E>>,
    key_store: Arc<KeyStore>,
    cold: Option<Arc<dyn ColdStorage>>,
    config: BackupConfig,
    phase: Mutex<BackupPhase>,
    run_lock: tokio::sync::Mutex<()>,
    schedule: Mutex<Option<BackgroundTask>>,
}

impl<E: StorageEngine> BackupCoordinator<E> {
    pub fn new(
        pool: Arc<StorageHandlePool<E>>,
        key_store: Arc<KeyStore>,
        cold: Option<Arc<dyn ColdStorage>>,
        config: BackupConfig,
    ) -> Self {
        if cold.is_none() {
            warn!("Cold storage not configured, backups and restores are disabled");
        }
        Self {
            paths: pool.paths().clone(),
            pool,
            key_store,
            cold,
            config,
            phase: Mutex::new(BackupPhase::Idle),
            run_lock: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.cold.is_some()
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn phase(&self) -> BackupPhase {
        self.phase.lock().map(|p| *p).unwrap_or_default()
    }

    fn set_phase(&self, phase: BackupPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    fn cold(&self) -> BackupResult<&Arc<dyn ColdStorage>> {
        self.cold.as_ref().ok_or(BackupError::ConfigurationMissing)
    }

    // ========== Snapshot ==========

    /// Snapshot the metadata store, then every tenant store (or the shared one).
    pub async fn run_backup(&self) -> BackupResult<BackupReport> {
        let timestamp = format_timestamp(Utc::now());
        let Some(cold) = self.cold.clone() else {
            warn!("Backup skipped: cold storage not configured");
            let mut report = BackupReport::new(timestamp);
            report.skipped = true;
            return Ok(report);
        };

        let _running = self.run_lock.lock().await;
        let mut report = BackupReport::new(timestamp);
        info!(run_id = %report.run_id, mode = %self.config.mode, "Backup run starting");

        self.set_phase(BackupPhase::Checkpointing);
        let meta_key = SnapshotTarget::Meta.key(&report.timestamp);
        match self.snapshot_meta(&cold, &meta_key).await {
            Ok(()) => report.meta_key = Some(meta_key),
            Err(e) => {
                error!(key = %meta_key, error = %e, "Metadata snapshot failed");
                report.failures.push(BackupFailure {
                    target: SnapshotTarget::Meta.to_string(),
                    error: e.to_string(),
                });
            }
        }

        let snapshotted = match self.config.mode {
            StorageMode::Shared => {
                self.snapshot_shared(&cold, &mut report).await;
                Ok(())
            }
            StorageMode::Isolated => self.snapshot_tenants(&cold, &mut report).await,
        };
        self.set_phase(BackupPhase::Idle);
        snapshotted?;

        if report.is_partial() {
            warn!(
                run_id = %report.run_id,
                uploaded = report.uploaded.len(),
                failed = report.failures.len(),
                "Backup run finished with failures"
            );
        } else {
            info!(
                run_id = %report.run_id,
                uploaded = report.uploaded.len(),
                "Backup run finished"
            );
        }
        Ok(report)
    }

    async fn snapshot_meta(&self, cold: &Arc<dyn ColdStorage>, key: &str) -> BackupResult<()> {
        let store = Arc::clone(&self.key_store);
        tokio::task::spawn_blocking(move || store.checkpoint())
            .await
            .map_err(|e| BackupError::Task(e.to_string()))??;
        let bytes = tokio::fs::read(self.key_store.path()).await?;
        cold.put(key, bytes).await?;
        Ok(())
    }

    async fn snapshot_shared(&self, cold: &Arc<dyn ColdStorage>, report: &mut BackupReport) {
        let key = SnapshotTarget::Shared.key(&report.timestamp);
        if let Err(e) = self.pool.checkpoint_shared().await {
            warn!(error = %e, "Checkpoint of shared store failed, snapshotting anyway");
        }
        self.set_phase(BackupPhase::Snapshotting);

        let result = async {
            let bytes = tokio::fs::read(self.paths.shared_vault()).await?;
            cold.put(&key, bytes).await?;
            Ok::<_, BackupError>(())
        }
        .await;
        match result {
            Ok(()) => report.uploaded.push(key),
            Err(e) => {
                error!(key = %key, error = %e, "Shared store snapshot failed");
                report.failures.push(BackupFailure {
                    target: SnapshotTarget::Shared.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn snapshot_tenants(
        &self,
        cold: &Arc<dyn ColdStorage>,
        report: &mut BackupReport,
    ) -> BackupResult<()> {
        let tenants = self.tenant_dirs().await?;
        self.set_phase(BackupPhase::Snapshotting);
        info!(count = tenants.len(), "Snapshotting tenant stores");

        for batch in tenants.chunks(self.config.concurrency.max(1)) {
            let mut uploads = JoinSet::new();
            for tenant_id in batch {
                let pool = Arc::clone(&self.pool);
                let cold = Arc::clone(cold);
                let tenant_id = tenant_id.clone();
                let key = SnapshotTarget::Tenant(&tenant_id).key(&report.timestamp);
                uploads.spawn(async move {
                    let result = snapshot_tenant(&pool, cold.as_ref(), &tenant_id, &key).await;
                    (tenant_id, key, result)
                });
            }

            while let Some(joined) = uploads.join_next().await {
                match joined {
                    Ok((_, key, Ok(()))) => report.uploaded.push(key),
                    Ok((tenant_id, key, Err(e))) => {
                        warn!(tenant_id = %tenant_id, key = %key, error = %e, "Tenant snapshot failed");
                        report.failures.push(BackupFailure {
                            target: SnapshotTarget::Tenant(&tenant_id).to_string(),
                            error: e.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Snapshot task failed");
                        report.failures.push(BackupFailure {
                            target: "unknown".to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        report.uploaded.sort();
        Ok(())
    }

    /// Tenant ids with a directory under `users/`, sorted.
    async fn tenant_dirs(&self) -> BackupResult<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(self.paths.users_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tenants = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_tenant_id(&name) {
                tenants.push(name);
            } else {
                warn!(dir = %name, "Skipping directory with invalid tenant id");
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    // ========== Prune ==========

    /// Delete every snapshot dated strictly before `now - retention_days`.
    pub async fn prune_old_backups(&self, retention_days: u32) -> BackupResult<PruneReport> {
        self.prune_before(retention_days, Utc::now()).await
    }

    async fn prune_before(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> BackupResult<PruneReport> {
        let Some(cold) = self.cold.as_ref() else {
            warn!("Prune skipped: cold storage not configured");
            return Ok(PruneReport {
                skipped: true,
                ..PruneReport::default()
            });
        };

        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        let objects = list_all(cold.as_ref(), BACKUP_PREFIX).await?;
        let mut report = PruneReport {
            scanned: objects.len(),
            ..PruneReport::default()
        };

        let mut expired = Vec::new();
        for object in objects {
            let Some(date) = key_date(&object.key) else {
                warn!(key = %object.key, "Snapshot key has no parseable date, keeping it");
                report.unparseable += 1;
                continue;
            };
            if date.and_time(chrono::NaiveTime::MIN).and_utc() < cutoff {
                expired.push(object.key);
            }
        }

        for batch in expired.chunks(MAX_DELETE_BATCH) {
            match cold.delete_batch(batch).await {
                Ok(()) => report.deleted += batch.len(),
                Err(e) => {
                    warn!(count = batch.len(), error = %e, "Deleting expired snapshots failed");
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            retention_days,
            scanned = report.scanned,
            deleted = report.deleted,
            "Pruned old snapshots"
        );
        Ok(report)
    }

    // ========== Schedule ==========

    /// Back up and prune now, then every configured interval.
    ///
    /// No-op without cold storage. Replaces any running schedule.
    pub fn schedule_backups(self: &Arc<Self>) {
        if self.cold.is_none() {
            warn!("Backup schedule not started: cold storage not configured");
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = BackgroundTask::spawn_periodic(
            "backup-schedule",
            self.config.interval,
            true,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(coordinator) = weak.upgrade() else {
                        return false;
                    };
                    coordinator.scheduled_run().await;
                    true
                }
            },
        );

        if let Ok(mut schedule) = self.schedule.lock() {
            *schedule = Some(task);
        }
    }

    async fn scheduled_run(&self) {
        if let Err(e) = self.run_backup().await {
            error!(error = %e, "Scheduled backup failed");
        }
        self.set_phase(BackupPhase::Pruning);
        if let Err(e) = self.prune_old_backups(self.config.retention_days).await {
            error!(error = %e, "Scheduled prune failed");
        }
        self.set_phase(BackupPhase::Idle);
    }

    /// Cancel the schedule and wait for an in-flight run to finish.
    pub async fn stop_schedule(&self) {
        let task = self.schedule.lock().ok().and_then(|mut s| s.take());
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .lock()
            .map(|s| s.as_ref().is_some_and(BackgroundTask::is_running))
            .unwrap_or(false)
    }

    // ========== Restore ==========

    /// Timestamps of every snapshot of `target`, oldest first.
    pub async fn list_snapshots(&self, target: SnapshotTarget<'_>) -> BackupResult<Vec<String>> {
        let cold = self.cold()?;
        let mut timestamps: Vec<String> = list_all(cold.as_ref(), BACKUP_PREFIX)
            .await?
            .iter()
            .filter_map(|o| target.timestamp_of(&o.key).map(str::to_string))
            .collect();
        timestamps.sort();
        Ok(timestamps)
    }

    /// Replace a tenant's store with its snapshot at `timestamp`.
    pub async fn restore_tenant(&self, tenant_id: &str, timestamp: &str) -> BackupResult<()> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(BackupError::InvalidTenantId(tenant_id.to_string()));
        }
        let target = SnapshotTarget::Tenant(tenant_id);
        let bytes = self.download(target, timestamp).await?;

        let _restoring = self.pool.begin_restore(tenant_id).await?;
        let dest = self.paths.tenant_vault(tenant_id);
        self.activate(target, bytes, &dest, self.engine_verifier())
            .await
    }

    /// Replace the shared-mode store with its snapshot at `timestamp`.
    pub async fn restore_shared(&self, timestamp: &str) -> BackupResult<()> {
        let target = SnapshotTarget::Shared;
        let bytes = self.download(target, timestamp).await?;

        let _restoring = self.pool.begin_restore_shared().await?;
        let dest = self.paths.shared_vault();
        self.activate(target, bytes, &dest, self.engine_verifier())
            .await
    }

    /// Replace `meta.db` with its snapshot at `timestamp`.
    ///
    /// The key store is closed only after the snapshot verifies and is
    /// reopened whether or not the swap succeeds.
    pub async fn restore_meta(&self, timestamp: &str) -> BackupResult<()> {
        let target = SnapshotTarget::Meta;
        let bytes = self.download(target, timestamp).await?;
        let dest = self.key_store.path().to_path_buf();
        let staging = self
            .stage(target, bytes, &dest, KeyStore::verify)
            .await?;

        let store = Arc::clone(&self.key_store);
        let swap = tokio::task::spawn_blocking(move || {
            store.close()?;
            let renamed = std::fs::rename(&staging, &dest).map_err(StoreError::from);
            if renamed.is_err() {
                let _ = std::fs::remove_file(&staging);
            }
            store.reopen()?;
            renamed
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?;
        swap?;

        info!(timestamp = %timestamp, "Restored metadata store");
        Ok(())
    }

    fn engine_verifier(&self) -> impl FnOnce(&Path) -> Result<(), StoreError> + Send + 'static {
        let pool = Arc::clone(&self.pool);
        move |path| pool.engine().verify(path)
    }

    async fn download(&self, target: SnapshotTarget<'_>, timestamp: &str) -> BackupResult<Vec<u8>> {
        let cold = self.cold()?;
        if parse_timestamp(timestamp).is_none() {
            return Err(BackupError::InvalidTimestamp(timestamp.to_string()));
        }
        let key = target.key(timestamp);
        match cold.get(&key).await {
            Ok(bytes) => Ok(bytes),
            Err(ColdStorageError::NotFound(_)) => Err(BackupError::SnapshotNotFound(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` next to `dest` and verify them. Returns the staging path.
    async fn stage<V>(
        &self,
        target: SnapshotTarget<'_>,
        bytes: Vec<u8>,
        dest: &Path,
        verify: V,
    ) -> BackupResult<PathBuf>
    where
        V: FnOnce(&Path) -> Result<(), StoreError> + Send + 'static,
    {
        let staging = staging_path(dest);
        let mut created_dir = None;
        if let Some(dir) = staging.parent() {
            if !tokio::fs::try_exists(dir).await? {
                tokio::fs::create_dir_all(dir).await?;
                created_dir = Some(dir.to_path_buf());
            }
        }
        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            discard_staging(&staging, created_dir.as_deref()).await;
            return Err(e.into());
        }

        let check_path = staging.clone();
        let verified = tokio::task::spawn_blocking(move || verify(&check_path))
            .await
            .map_err(|e| BackupError::Task(e.to_string()));

        let failure = match verified {
            Ok(Ok(())) => return Ok(staging),
            Ok(Err(e)) => BackupError::Integrity(e.to_string()),
            Err(e) => e,
        };
        discard_staging(&staging, created_dir.as_deref()).await;
        error!(snapshot = %target, error = %failure, "Snapshot rejected, destination untouched");
        Err(failure)
    }

    /// Stage, verify and atomically move a snapshot over `dest`.
    async fn activate<V>(
        &self,
        target: SnapshotTarget<'_>,
        bytes: Vec<u8>,
        dest: &Path,
        verify: V,
    ) -> BackupResult<()>
    where
        V: FnOnce(&Path) -> Result<(), StoreError> + Send + 'static,
    {
        let staging = self.stage(target, bytes, dest, verify).await?;
        if let Err(e) = tokio::fs::rename(&staging, dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        info!(snapshot = %target, path = %dest.display(), "Restored snapshot");
        Ok(())
    }
}

/// Remove a rejected staging file, and the directory staging created for it
/// so a tenant that never existed locally does not appear in later backups.
async fn discard_staging(staging: &Path, created_dir: Option<&Path>) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Removing staging file failed");
        }
    }
    if let Some(dir) = created_dir {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            warn!(path = %dir.display(), error = %e, "Removing staging directory failed");
        }
    }
}

/// Checkpoint a live handle (best effort), read the file and upload it.
async fn snapshot_tenant<E: StorageEngine>(
    pool: &StorageHandlePool<E>,
    cold: &dyn ColdStorage,
    tenant_id: &str,
    key: &str,
) -> BackupResult<()> {
    if let Err(e) = pool.checkpoint(tenant_id).await {
        warn!(tenant_id = %tenant_id, error = %e, "Checkpoint before snapshot failed");
    }
    let bytes = tokio::fs::read(pool.paths().tenant_vault(tenant_id)).await?;
    cold.put(key, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{RedbEngine, StoreHandle};
    use crate::storage::pool::PoolConfig;
    use crate::keys::{EncryptedDekRecord, EncryptionMode};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _data: TempDir,
        _cold_dir: TempDir,
        cold: Arc<FsColdStorage>,
        pool: Arc<StorageHandlePool<RedbEngine>>,
        key_store: Arc<KeyStore>,
        coordinator: Arc<BackupCoordinator<RedbEngine>>,
    }

    fn fixture(mode: StorageMode) -> Fixture {
        let data = TempDir::new().unwrap();
        let cold_dir = TempDir::new().unwrap();
        let paths = StoragePaths::new(data.path());
        let key_store = Arc::new(KeyStore::open(&paths.meta_db()).unwrap());
        let pool = Arc::new(StorageHandlePool::new(
            RedbEngine,
            paths,
            PoolConfig::default(),
        ));
        let cold = Arc::new(FsColdStorage::new(cold_dir.path()));
        let coordinator = Arc::new(BackupCoordinator::new(
            Arc::clone(&pool),
            Arc::clone(&key_store),
            Some(Arc::clone(&cold) as Arc<dyn ColdStorage>),
            BackupConfig {
                mode,
                interval: Duration::from_secs(3600),
                retention_days: 30,
                concurrency: 2,
            },
        ));
        Fixture {
            _data: data,
            _cold_dir: cold_dir,
            cold,
            pool,
            key_store,
            coordinator,
        }
    }

    fn key_record(tag: &str) -> EncryptedDekRecord {
        EncryptedDekRecord {
            encrypted_dek: format!("dek-{tag}"),
            dek_salt: format!("salt-{tag}"),
            encryption_mode: EncryptionMode::Legacy,
            share_hash: None,
        }
    }

    async fn write_record(fx: &Fixture, tenant: &str, id: &str) {
        let handle = fx.pool.get(tenant).await.unwrap();
        handle.insert_record(None, id, b"payload").unwrap();
    }

    #[test]
    fn timestamp_format_and_keys() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        let ts = format_timestamp(at);
        assert_eq!(ts, "2026-10-16T09-05-07-042Z");
        assert_eq!(parse_timestamp(&ts).unwrap(), at.naive_utc());
        assert!(parse_timestamp("2026-10-16").is_none());

        assert_eq!(
            SnapshotTarget::Meta.key(&ts),
            "backups/2026-10-16/meta-2026-10-16T09-05-07-042Z.db"
        );
        assert_eq!(
            SnapshotTarget::Tenant("alice").key(&ts),
            "backups/2026-10-16/users/alice/vault-2026-10-16T09-05-07-042Z.db"
        );
        assert_eq!(
            SnapshotTarget::Shared.key(&ts),
            "backups/2026-10-16/vault-2026-10-16T09-05-07-042Z.db"
        );

        let key = SnapshotTarget::Tenant("alice").key(&ts);
        assert_eq!(SnapshotTarget::Tenant("alice").timestamp_of(&key), Some(ts.as_str()));
        assert_eq!(SnapshotTarget::Tenant("alic").timestamp_of(&key), None);
        assert_eq!(SnapshotTarget::Shared.timestamp_of(&key), None);
        assert_eq!(key_date(&key), NaiveDate::from_ymd_opt(2026, 10, 16));
    }

    #[tokio::test]
    async fn isolated_backup_uploads_meta_and_every_tenant() {
        let fx = fixture(StorageMode::Isolated);
        fx.key_store.put("alice", &key_record("a")).unwrap();
        for tenant in ["alice", "bob", "carol"] {
            write_record(&fx, tenant, "n1").await;
        }
        // Closed tenants are still snapshotted from disk
        fx.pool.evict("carol").await.unwrap();

        let report = fx.coordinator.run_backup().await.unwrap();
        assert!(!report.skipped);
        assert!(!report.is_partial(), "{:?}", report.failures);
        assert_eq!(report.uploaded.len(), 3);

        let meta_key = report.meta_key.clone().unwrap();
        assert!(meta_key.starts_with(&format!("backups/{}/meta-", &report.timestamp[..10])));
        assert!(fx.cold.get(&meta_key).await.is_ok());
        for tenant in ["alice", "bob", "carol"] {
            let key = SnapshotTarget::Tenant(tenant).key(&report.timestamp);
            assert!(report.uploaded.contains(&key));
            let bytes = fx.cold.get(&key).await.unwrap();
            assert!(!bytes.is_empty());
        }
        assert_eq!(fx.coordinator.phase(), BackupPhase::Idle);
    }

    #[tokio::test]
    async fn one_failed_tenant_does_not_abort_the_run() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "n1").await;
        write_record(&fx, "bob", "n1").await;
        // Directory without a store file
        std::fs::create_dir_all(fx.pool.paths().tenant_dir("broken")).unwrap();

        let report = fx.coordinator.run_backup().await.unwrap();
        assert!(report.is_partial());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, "tenant:broken");
        assert_eq!(report.uploaded.len(), 2);
        assert!(report.meta_key.is_some());
    }

    #[tokio::test]
    async fn shared_backup_uploads_single_store() {
        let fx = fixture(StorageMode::Shared);
        let handle = fx.pool.get_shared().await.unwrap();
        handle.insert_record(Some("alice"), "n1", b"x").unwrap();

        let report = fx.coordinator.run_backup().await.unwrap();
        assert_eq!(
            report.uploaded,
            vec![SnapshotTarget::Shared.key(&report.timestamp)]
        );
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn without_cold_storage_everything_degrades() {
        let data = TempDir::new().unwrap();
        let paths = StoragePaths::new(data.path());
        let key_store = Arc::new(KeyStore::open(&paths.meta_db()).unwrap());
        let pool = Arc::new(StorageHandlePool::new(RedbEngine, paths, PoolConfig::default()));
        let coordinator = Arc::new(BackupCoordinator::new(
            pool,
            key_store,
            None,
            BackupConfig::default(),
        ));

        assert!(!coordinator.is_configured());
        assert!(coordinator.run_backup().await.unwrap().skipped);
        assert!(coordinator.prune_old_backups(30).await.unwrap().skipped);
        assert!(matches!(
            coordinator
                .restore_tenant("alice", "2026-10-16T09-05-07-042Z")
                .await,
            Err(BackupError::ConfigurationMissing)
        ));
        coordinator.schedule_backups();
        assert!(!coordinator.is_scheduled());
    }

    #[tokio::test]
    async fn prune_deletes_only_objects_older_than_retention() {
        let fx = fixture(StorageMode::Isolated);
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        // now - 30 days = 2026-09-16T12:00Z
        let expired = [
            "backups/2026-08-01/meta-2026-08-01T00-00-00-000Z.db",
            "backups/2026-09-15/users/alice/vault-2026-09-15T23-59-59-999Z.db",
            "backups/2026-09-16/meta-2026-09-16T00-00-00-000Z.db",
        ];
        let kept = [
            "backups/2026-09-17/meta-2026-09-17T00-00-00-000Z.db",
            "backups/2026-10-16/vault-2026-10-16T11-00-00-000Z.db",
            "backups/not-a-date/meta.db",
        ];
        for key in expired.iter().chain(kept.iter()) {
            fx.cold.put(key, vec![1]).await.unwrap();
        }

        let report = fx.coordinator.prune_before(30, now).await.unwrap();
        assert_eq!(report.scanned, 6);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.unparseable, 1);

        let left: Vec<String> = list_all(fx.cold.as_ref(), BACKUP_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        let mut expected: Vec<String> = kept.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn prune_batches_large_deletes() {
        let fx = fixture(StorageMode::Isolated);
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        for i in 0..(MAX_DELETE_BATCH + 5) {
            fx.cold
                .put(&format!("backups/2025-01-01/users/t{i}/vault.db"), vec![0])
                .await
                .unwrap();
        }
        let report = fx.coordinator.prune_before(30, now).await.unwrap();
        assert_eq!(report.deleted, MAX_DELETE_BATCH + 5);
        assert_eq!(report.failed_batches, 0);
        assert!(list_all(fx.cold.as_ref(), BACKUP_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_tenant_replaces_live_store() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "before").await;
        let report = fx.coordinator.run_backup().await.unwrap();

        write_record(&fx, "alice", "after").await;
        assert!(fx.pool.has("alice"));

        fx.coordinator
            .restore_tenant("alice", &report.timestamp)
            .await
            .unwrap();
        assert!(!fx.pool.has("alice"));
        assert!(!staging_path(&fx.pool.paths().tenant_vault("alice")).exists());

        let handle = fx.pool.get("alice").await.unwrap();
        assert!(handle.get_record(None, "before").unwrap().is_some());
        assert!(handle.get_record(None, "after").unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_snapshot_leaves_destination_untouched() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "n1").await;
        let report = fx.coordinator.run_backup().await.unwrap();
        let key = SnapshotTarget::Tenant("alice").key(&report.timestamp);

        let mut bytes = fx.cold.get(&key).await.unwrap();
        bytes[0] ^= 0xFF;
        fx.cold.put(&key, bytes).await.unwrap();

        fx.pool.evict("alice").await.unwrap();
        let dest = fx.pool.paths().tenant_vault("alice");
        let before = std::fs::read(&dest).unwrap();

        let result = fx.coordinator.restore_tenant("alice", &report.timestamp).await;
        assert!(matches!(result, Err(BackupError::Integrity(_))));
        assert_eq!(std::fs::read(&dest).unwrap(), before);
        assert!(!staging_path(&dest).exists());

        // Opens are allowed again once the restore has ended
        let handle = fx.pool.get("alice").await.unwrap();
        assert!(handle.get_record(None, "n1").unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_data_page_is_rejected() {
        let fx = fixture(StorageMode::Isolated);
        let payload = b"distinctive-record-payload-0123456789";
        let handle = fx.pool.get("alice").await.unwrap();
        handle.insert_record(None, "n1", payload).unwrap();
        let report = fx.coordinator.run_backup().await.unwrap();
        let key = SnapshotTarget::Tenant("alice").key(&report.timestamp);

        // Flip a byte inside every copy of the record value
        let mut bytes = fx.cold.get(&key).await.unwrap();
        let offsets: Vec<usize> = bytes
            .windows(payload.len())
            .enumerate()
            .filter(|(_, w)| *w == payload)
            .map(|(i, _)| i + payload.len() / 2)
            .collect();
        assert!(!offsets.is_empty(), "payload not found in snapshot");
        for offset in offsets {
            bytes[offset] ^= 0x01;
        }
        fx.cold.put(&key, bytes).await.unwrap();

        fx.pool.evict("alice").await.unwrap();
        let dest = fx.pool.paths().tenant_vault("alice");
        let before = std::fs::read(&dest).unwrap();

        let result = fx.coordinator.restore_tenant("alice", &report.timestamp).await;
        assert!(matches!(result, Err(BackupError::Integrity(_))));
        assert_eq!(std::fs::read(&dest).unwrap(), before);
        assert!(!staging_path(&dest).exists());

        let handle = fx.pool.get("alice").await.unwrap();
        assert_eq!(handle.get_record(None, "n1").unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn rejected_restore_of_unknown_tenant_leaves_no_directory() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "n1").await;
        let report = fx.coordinator.run_backup().await.unwrap();

        // Publish a corrupt snapshot under a tenant with no local store
        let mut bytes = fx
            .cold
            .get(&SnapshotTarget::Tenant("alice").key(&report.timestamp))
            .await
            .unwrap();
        bytes[0] ^= 0xFF;
        fx.cold
            .put(&SnapshotTarget::Tenant("ghost").key(&report.timestamp), bytes)
            .await
            .unwrap();

        let result = fx.coordinator.restore_tenant("ghost", &report.timestamp).await;
        assert!(matches!(result, Err(BackupError::Integrity(_))));
        assert!(!fx.pool.paths().tenant_dir("ghost").exists());

        let next = fx.coordinator.run_backup().await.unwrap();
        assert!(next.failures.is_empty(), "{:?}", next.failures);
    }

    #[tokio::test]
    async fn restore_rejects_bad_inputs() {
        let fx = fixture(StorageMode::Isolated);
        assert!(matches!(
            fx.coordinator.restore_tenant("alice", "yesterday").await,
            Err(BackupError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            fx.coordinator
                .restore_tenant("../etc", "2026-10-16T09-05-07-042Z")
                .await,
            Err(BackupError::InvalidTenantId(_))
        ));
        assert!(matches!(
            fx.coordinator
                .restore_tenant("alice", "2026-10-16T09-05-07-042Z")
                .await,
            Err(BackupError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_shared_roundtrip() {
        let fx = fixture(StorageMode::Shared);
        let handle = fx.pool.get_shared().await.unwrap();
        handle.insert_record(Some("alice"), "kept", b"x").unwrap();
        let report = fx.coordinator.run_backup().await.unwrap();
        handle.insert_record(Some("alice"), "dropped", b"y").unwrap();

        fx.coordinator.restore_shared(&report.timestamp).await.unwrap();
        assert!(!handle.is_open());

        let handle = fx.pool.get_shared().await.unwrap();
        assert!(handle.get_record(Some("alice"), "kept").unwrap().is_some());
        assert!(handle.get_record(Some("alice"), "dropped").unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_meta_swaps_key_records() {
        let fx = fixture(StorageMode::Isolated);
        fx.key_store.put("alice", &key_record("old")).unwrap();
        let report = fx.coordinator.run_backup().await.unwrap();

        fx.key_store.put("alice", &key_record("new")).unwrap();
        fx.key_store.put("bob", &key_record("b")).unwrap();

        fx.coordinator.restore_meta(&report.timestamp).await.unwrap();
        assert!(fx.key_store.is_open());
        assert_eq!(fx.key_store.get("alice").unwrap().unwrap(), key_record("old"));
        assert!(fx.key_store.get("bob").unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_meta_snapshot_keeps_store_open() {
        let fx = fixture(StorageMode::Isolated);
        fx.key_store.put("alice", &key_record("a")).unwrap();
        let report = fx.coordinator.run_backup().await.unwrap();
        let key = report.meta_key.clone().unwrap();
        fx.cold.put(&key, b"not a database".to_vec()).await.unwrap();

        let result = fx.coordinator.restore_meta(&report.timestamp).await;
        assert!(matches!(result, Err(BackupError::Integrity(_))));
        assert!(fx.key_store.is_open());
        assert_eq!(fx.key_store.get("alice").unwrap().unwrap(), key_record("a"));
    }

    #[tokio::test]
    async fn list_snapshots_filters_by_target() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "n1").await;
        let first = fx.coordinator.run_backup().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = fx.coordinator.run_backup().await.unwrap();

        let alice = fx
            .coordinator
            .list_snapshots(SnapshotTarget::Tenant("alice"))
            .await
            .unwrap();
        assert_eq!(alice, vec![first.timestamp.clone(), second.timestamp.clone()]);
        assert_eq!(
            fx.coordinator.list_snapshots(SnapshotTarget::Meta).await.unwrap().len(),
            2
        );
        assert!(fx
            .coordinator
            .list_snapshots(SnapshotTarget::Shared)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn schedule_runs_immediately_and_stops() {
        let fx = fixture(StorageMode::Isolated);
        write_record(&fx, "alice", "n1").await;

        fx.coordinator.schedule_backups();
        assert!(fx.coordinator.is_scheduled());
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.coordinator.stop_schedule().await;
        assert!(!fx.coordinator.is_scheduled());

        let snapshots = fx
            .coordinator
            .list_snapshots(SnapshotTarget::Tenant("alice"))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
    }
}
