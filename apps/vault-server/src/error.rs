// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Service-level error type.
//!
//! Every module owns its own error enum; [`VaultError`] wraps them for callers
//! of [`crate::state::VaultServices`] and exposes a stable machine-readable
//! [`VaultError::error_code`] for the transport layer to map.

use crate::backup::{BackupError, ColdStorageError};
use crate::config::ConfigError;
use crate::context::ContextError;
use crate::crypto::CryptoError;
use crate::keys::KeyError;
use crate::storage::engine::StoreError;
use crate::storage::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    ColdStorage(#[from] ColdStorageError),

    /// Key operations were requested without a master secret.
    #[error("master secret is not configured")]
    MasterSecretMissing,

    #[error("tenant {0} is already provisioned")]
    AlreadyProvisioned(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            VaultError::Config(_) => "invalid_configuration",
            VaultError::Crypto(e) => crypto_code(e),
            VaultError::Key(e) => key_code(e),
            VaultError::Store(e) => store_code(e),
            VaultError::Pool(e) => pool_code(e),
            VaultError::Context(e) => context_code(e),
            VaultError::Backup(e) => backup_code(e),
            VaultError::ColdStorage(_) => "cold_storage_error",
            VaultError::MasterSecretMissing => "configuration_missing",
            VaultError::AlreadyProvisioned(_) => "already_provisioned",
            VaultError::Task(_) => "internal_error",
        }
    }

    /// Whether the caller can fix the request (as opposed to a server fault).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.error_code(),
            "authentication_failure"
                | "missing_secret_share"
                | "invalid_tenant_id"
                | "invalid_timestamp"
                | "snapshot_not_found"
                | "already_provisioned"
        )
    }
}

fn crypto_code(e: &CryptoError) -> &'static str {
    match e {
        CryptoError::Authentication => "authentication_failure",
        _ => "crypto_error",
    }
}

fn key_code(e: &KeyError) -> &'static str {
    match e {
        KeyError::Crypto(inner) => crypto_code(inner),
        KeyError::MissingSecretShare => "missing_secret_share",
        KeyError::ShareMismatch => "authentication_failure",
        KeyError::Derivation(_) | KeyError::MalformedRecord(_) => "key_error",
    }
}

fn store_code(e: &StoreError) -> &'static str {
    match e {
        StoreError::Integrity(_) => "integrity_failure",
        _ => "storage_error",
    }
}

fn pool_code(e: &PoolError) -> &'static str {
    match e {
        PoolError::InvalidTenantId(_) => "invalid_tenant_id",
        PoolError::RestoreInProgress(_) => "restore_in_progress",
        PoolError::Store(inner) => store_code(inner),
        PoolError::Task(_) | PoolError::Poisoned => "internal_error",
    }
}

fn context_code(e: &ContextError) -> &'static str {
    match e {
        ContextError::Pool(inner) => pool_code(inner),
        ContextError::Key(inner) => key_code(inner),
        ContextError::Crypto(inner) => crypto_code(inner),
        ContextError::Store(inner) => store_code(inner),
        ContextError::MissingKeyRecord(_) => "missing_key_record",
        ContextError::EncryptionDisabled => "configuration_missing",
        ContextError::Task(_) => "internal_error",
    }
}

fn backup_code(e: &BackupError) -> &'static str {
    match e {
        BackupError::ConfigurationMissing => "configuration_missing",
        BackupError::Integrity(_) => "integrity_failure",
        BackupError::SnapshotNotFound(_) => "snapshot_not_found",
        BackupError::InvalidTimestamp(_) => "invalid_timestamp",
        BackupError::InvalidTenantId(_) => "invalid_tenant_id",
        BackupError::Pool(inner) => pool_code(inner),
        BackupError::Store(inner) => store_code(inner),
        BackupError::ColdStorage(_) => "cold_storage_error",
        BackupError::Io(_) | BackupError::Task(_) => "internal_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes() {
        let cases: Vec<(VaultError, &str)> = vec![
            (BackupError::ConfigurationMissing.into(), "configuration_missing"),
            (ContextError::EncryptionDisabled.into(), "configuration_missing"),
            (CryptoError::Authentication.into(), "authentication_failure"),
            (
                ContextError::Key(KeyError::Crypto(CryptoError::Authentication)).into(),
                "authentication_failure",
            ),
            (
                ContextError::MissingKeyRecord("t".into()).into(),
                "missing_key_record",
            ),
            (
                ContextError::Key(KeyError::MissingSecretShare).into(),
                "missing_secret_share",
            ),
            (BackupError::Integrity("bad".into()).into(), "integrity_failure"),
            (
                PoolError::RestoreInProgress("t".into()).into(),
                "restore_in_progress",
            ),
            (
                ContextError::Pool(PoolError::InvalidTenantId("../x".into())).into(),
                "invalid_tenant_id",
            ),
            (VaultError::MasterSecretMissing, "configuration_missing"),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "{err}");
        }
    }

    #[test]
    fn caller_errors_are_distinguished() {
        assert!(VaultError::from(KeyError::ShareMismatch).is_caller_error());
        assert!(VaultError::AlreadyProvisioned("t".into()).is_caller_error());
        assert!(!VaultError::from(BackupError::Integrity("x".into())).is_caller_error());
        assert!(!VaultError::Task("join".into()).is_caller_error());
    }
}
