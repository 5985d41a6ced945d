// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the service. Configuration is loaded from the environment once
//! at startup; malformed values abort startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for tenant stores and `meta.db` | `/data` |
//! | `VAULT_MASTER_SECRET` | Server-held secret wrapping every DEK | Unset (encryption disabled) |
//! | `VAULT_STORAGE_MODE` | `isolated` (store per tenant) or `shared` | `isolated` |
//! | `POOL_MAX_HANDLES` | Maximum open tenant stores | `100` |
//! | `POOL_IDLE_TIMEOUT_SECS` | Idle time before a store is closed | `600` |
//! | `POOL_SWEEP_INTERVAL_SECS` | Idle sweep period | `60` |
//! | `CONTEXT_TTL_SECS` | Request context lifetime | `300` |
//! | `BACKUP_DIR` | Cold storage root directory | Unset (backups disabled) |
//! | `BACKUP_INTERVAL_HOURS` | Scheduled backup period | `24` |
//! | `BACKUP_RETENTION_DAYS` | Age after which snapshots are pruned | `30` |
//! | `BACKUP_CONCURRENCY` | Concurrent uploads per batch | `5` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::keys::MasterSecret;
use crate::storage::paths::DATA_ROOT;

/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Environment variable holding the master secret.
///
/// Never logged and never persisted. Without it tenant content is stored in
/// plaintext and key operations are unavailable.
pub const MASTER_SECRET_ENV: &str = "VAULT_MASTER_SECRET";

pub const STORAGE_MODE_ENV: &str = "VAULT_STORAGE_MODE";
pub const POOL_MAX_HANDLES_ENV: &str = "POOL_MAX_HANDLES";
pub const POOL_IDLE_TIMEOUT_ENV: &str = "POOL_IDLE_TIMEOUT_SECS";
pub const POOL_SWEEP_INTERVAL_ENV: &str = "POOL_SWEEP_INTERVAL_SECS";
pub const CONTEXT_TTL_ENV: &str = "CONTEXT_TTL_SECS";

/// Environment variable for the filesystem cold-storage root.
///
/// Unset disables backups and restores.
pub const BACKUP_DIR_ENV: &str = "BACKUP_DIR";
pub const BACKUP_INTERVAL_ENV: &str = "BACKUP_INTERVAL_HOURS";
pub const BACKUP_RETENTION_ENV: &str = "BACKUP_RETENTION_DAYS";
pub const BACKUP_CONCURRENCY_ENV: &str = "BACKUP_CONCURRENCY";

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_POOL_MAX_HANDLES: usize = 100;
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_POOL_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CONTEXT_TTL_SECS: u64 = 300;
pub const DEFAULT_BACKUP_INTERVAL_HOURS: u64 = 24;
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_BACKUP_CONCURRENCY: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// How tenant data is laid out on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// One store file per tenant under `users/{tenant_id}/`.
    #[default]
    Isolated,
    /// A single store file; every row is scoped by tenant id.
    Shared,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(Self::Isolated),
            "shared" => Ok(Self::Shared),
            other => Err(format!("expected `isolated` or `shared`, got `{other}`")),
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => f.write_str("isolated"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    /// Read `LOG_FORMAT`; anything other than `json` means pretty.
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    pub master_secret: Option<MasterSecret>,
    pub storage_mode: StorageMode,
    pub pool_max_handles: usize,
    pub pool_idle_timeout: Duration,
    pub pool_sweep_interval: Duration,
    pub context_ttl: Duration,
    pub backup_dir: Option<PathBuf>,
    pub backup_interval: Duration,
    pub backup_retention_days: u32,
    pub backup_concurrency: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DATA_ROOT),
            master_secret: None,
            storage_mode: StorageMode::default(),
            pool_max_handles: DEFAULT_POOL_MAX_HANDLES,
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            pool_sweep_interval: Duration::from_secs(DEFAULT_POOL_SWEEP_INTERVAL_SECS),
            context_ttl: Duration::from_secs(DEFAULT_CONTEXT_TTL_SECS),
            backup_dir: None,
            backup_interval: Duration::from_secs(DEFAULT_BACKUP_INTERVAL_HOURS * 3600),
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
            backup_concurrency: DEFAULT_BACKUP_CONCURRENCY,
        }
    }
}

impl VaultConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let master_secret = get(MASTER_SECRET_ENV).map(MasterSecret::new);
        if master_secret.is_none() {
            warn!("{MASTER_SECRET_ENV} not set, tenant content will not be encrypted");
        }

        let storage_mode = match get(STORAGE_MODE_ENV) {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                name: STORAGE_MODE_ENV,
                reason,
            })?,
            None => defaults.storage_mode,
        };

        Ok(Self {
            data_dir: get(DATA_DIR_ENV).map(PathBuf::from).unwrap_or(defaults.data_dir),
            master_secret,
            storage_mode,
            pool_max_handles: parse_positive(
                &get,
                POOL_MAX_HANDLES_ENV,
                DEFAULT_POOL_MAX_HANDLES as u64,
            )? as usize,
            pool_idle_timeout: Duration::from_secs(parse_positive(
                &get,
                POOL_IDLE_TIMEOUT_ENV,
                DEFAULT_POOL_IDLE_TIMEOUT_SECS,
            )?),
            pool_sweep_interval: Duration::from_secs(parse_positive(
                &get,
                POOL_SWEEP_INTERVAL_ENV,
                DEFAULT_POOL_SWEEP_INTERVAL_SECS,
            )?),
            context_ttl: Duration::from_secs(parse_positive(
                &get,
                CONTEXT_TTL_ENV,
                DEFAULT_CONTEXT_TTL_SECS,
            )?),
            backup_dir: get(BACKUP_DIR_ENV).map(PathBuf::from),
            backup_interval: Duration::from_secs(
                parse_positive(&get, BACKUP_INTERVAL_ENV, DEFAULT_BACKUP_INTERVAL_HOURS)? * 3600,
            ),
            backup_retention_days: parse_positive(
                &get,
                BACKUP_RETENTION_ENV,
                DEFAULT_BACKUP_RETENTION_DAYS as u64,
            )?
            .try_into()
            .map_err(|_| ConfigError::Invalid {
                name: BACKUP_RETENTION_ENV,
                reason: "value too large".to_string(),
            })?,
            backup_concurrency: parse_positive(
                &get,
                BACKUP_CONCURRENCY_ENV,
                DEFAULT_BACKUP_CONCURRENCY as u64,
            )? as usize,
        })
    }

    pub fn encryption_enabled(&self) -> bool {
        self.master_secret.is_some()
    }
}

fn parse_positive(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = get(name) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("{e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
