// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the on-disk data layout.

use std::path::{Path, PathBuf};

/// Default base directory for all persistent storage.
pub const DATA_ROOT: &str = "/data";

/// Suffix of the scratch file a restore writes before activation.
pub const STAGING_SUFFIX: &str = "restore-staging";

/// Longest accepted tenant id.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Storage path utilities.
///
/// ```text
/// {root}/
///   meta.db                    # shared metadata store (key records)
///   vault.db                   # shared-mode vault (all tenants)
///   users/{tenant_id}/
///     vault.db                 # isolated-mode vault
/// ```
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Shared Stores ==========

    /// Metadata store holding every tenant's key record.
    pub fn meta_db(&self) -> PathBuf {
        self.root.join("meta.db")
    }

    /// Single vault shared by all tenants (shared mode).
    pub fn shared_vault(&self) -> PathBuf {
        self.root.join("vault.db")
    }

    // ========== Tenant Paths ==========

    /// Directory containing all tenant directories.
    pub fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    /// Directory for a specific tenant.
    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.users_dir().join(tenant_id)
    }

    /// Path to a tenant's isolated vault file.
    pub fn tenant_vault(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("vault.db")
    }
}

/// Staging path next to `dest` used while a restore is verified.
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

/// Whether `tenant_id` is safe to use as a directory name and key prefix.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && tenant_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_data_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("/data"));
        assert_eq!(paths.meta_db(), PathBuf::from("/data/meta.db"));
        assert_eq!(paths.shared_vault(), PathBuf::from("/data/vault.db"));
    }

    #[test]
    fn tenant_paths_are_correct() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_eq!(paths.users_dir(), PathBuf::from("/tmp/test-data/users"));
        assert_eq!(
            paths.tenant_dir("user_1"),
            PathBuf::from("/tmp/test-data/users/user_1")
        );
        assert_eq!(
            paths.tenant_vault("user_1"),
            PathBuf::from("/tmp/test-data/users/user_1/vault.db")
        );
    }

    #[test]
    fn staging_path_sits_next_to_destination() {
        assert_eq!(
            staging_path(Path::new("/data/users/u1/vault.db")),
            PathBuf::from("/data/users/u1/vault.db.restore-staging")
        );
    }

    #[test]
    fn tenant_id_validation() {
        assert!(is_valid_tenant_id("user_2f9c-AB"));
        assert!(!is_valid_tenant_id(""));
        assert!(!is_valid_tenant_id("../etc"));
        assert!(!is_valid_tenant_id("a/b"));
        assert!(!is_valid_tenant_id("space here"));
        assert!(!is_valid_tenant_id(&"x".repeat(MAX_TENANT_ID_LEN + 1)));
    }
}
