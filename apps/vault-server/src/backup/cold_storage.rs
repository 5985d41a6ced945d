// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cold storage object API and a filesystem implementation.
//!
//! Keys are `/`-separated relative names (`backups/2026-10-16/meta-….db`).
//! Listing is lexicographic and paginated; a continuation token is the last
//! key of the previous page.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Maximum number of keys accepted by one [`ColdStorage::delete_batch`] call.
pub const MAX_DELETE_BATCH: usize = 1000;

/// Default number of objects per listing page.
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ColdStorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("delete batch of {0} keys exceeds the limit of {MAX_DELETE_BATCH}")]
    BatchTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type ColdStorageResult<T> = Result<T, ColdStorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// Present when more objects follow.
    pub next_token: Option<String>,
}

/// Object store used for snapshots.
#[async_trait]
pub trait ColdStorage: Send + Sync + 'static {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ColdStorageResult<()>;

    async fn get(&self, key: &str) -> ColdStorageResult<Vec<u8>>;

    /// List objects under `prefix`, starting after `token`.
    async fn list(&self, prefix: &str, token: Option<&str>) -> ColdStorageResult<ListPage>;

    /// Delete up to [`MAX_DELETE_BATCH`] keys. Missing keys are ignored.
    async fn delete_batch(&self, keys: &[String]) -> ColdStorageResult<()>;
}

/// Every object under `prefix`, following continuation tokens.
pub async fn list_all(
    storage: &dyn ColdStorage,
    prefix: &str,
) -> ColdStorageResult<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = storage.list(prefix, token.as_deref()).await?;
        objects.extend(page.objects);
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(objects),
        }
    }
}

// =============================================================================
// Filesystem implementation
// =============================================================================

/// Cold storage rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct FsColdStorage {
    root: PathBuf,
    page_size: usize,
}

impl FsColdStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    /// Override the listing page size (at least 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> ColdStorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ColdStorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

async fn blocking<T, F>(f: F) -> ColdStorageResult<T>
where
    F: FnOnce() -> ColdStorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ColdStorageError::Task(e.to_string()))?
}

/// Collect `(key, size)` for every file below `dir`.
fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectInfo>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(".partial") {
                continue;
            }
            out.push(ObjectInfo {
                key,
                size: entry.metadata()?.len(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ColdStorage for FsColdStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ColdStorageResult<()> {
        let path = self.object_path(key)?;
        blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Write-then-rename so readers never see a torn object
            let mut partial = path.clone().into_os_string();
            partial.push(".partial");
            let partial = PathBuf::from(partial);
            std::fs::write(&partial, &bytes)?;
            std::fs::rename(&partial, &path)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> ColdStorageResult<Vec<u8>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ColdStorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str, token: Option<&str>) -> ColdStorageResult<ListPage> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let token = token.map(str::to_string);
        let page_size = self.page_size;

        blocking(move || {
            let mut all = Vec::new();
            walk(&root, &root, &mut all)?;
            all.retain(|o| {
                o.key.starts_with(&prefix) && token.as_deref().is_none_or(|t| o.key.as_str() > t)
            });
            all.sort_by(|a, b| a.key.cmp(&b.key));

            let more = all.len() > page_size;
            all.truncate(page_size);
            let next_token = if more {
                all.last().map(|o| o.key.clone())
            } else {
                None
            };
            Ok(ListPage {
                objects: all,
                next_token,
            })
        })
        .await
    }

    async fn delete_batch(&self, keys: &[String]) -> ColdStorageResult<()> {
        if keys.len() > MAX_DELETE_BATCH {
            return Err(ColdStorageError::BatchTooLarge(keys.len()));
        }
        let paths = keys
            .iter()
            .map(|k| self.object_path(k))
            .collect::<ColdStorageResult<Vec<_>>>()?;

        blocking(move || {
            for path in paths {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let storage = FsColdStorage::new(dir.path());

        storage.put("backups/a/x.db", b"one".to_vec()).await.unwrap();
        assert_eq!(storage.get("backups/a/x.db").await.unwrap(), b"one");

        storage.put("backups/a/x.db", b"two".to_vec()).await.unwrap();
        assert_eq!(storage.get("backups/a/x.db").await.unwrap(), b"two");

        assert!(matches!(
            storage.get("backups/a/missing.db").await,
            Err(ColdStorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let storage = FsColdStorage::new(dir.path());
        for key in ["", "../x", "/abs", "a/../../b", "./a"] {
            assert!(
                matches!(
                    storage.put(key, vec![1]).await,
                    Err(ColdStorageError::InvalidKey(_))
                ),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn list_is_sorted_filtered_and_paginated() {
        let dir = TempDir::new().unwrap();
        let storage = FsColdStorage::new(dir.path()).with_page_size(2);
        for key in [
            "backups/2026-01-02/b.db",
            "backups/2026-01-01/a.db",
            "backups/2026-01-03/c.db",
            "other/z.db",
        ] {
            storage.put(key, vec![0; 3]).await.unwrap();
        }

        let first = storage.list("backups/", None).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["backups/2026-01-01/a.db", "backups/2026-01-02/b.db"]);
        assert_eq!(first.objects[0].size, 3);

        let second = storage
            .list("backups/", first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "backups/2026-01-03/c.db");
        assert!(second.next_token.is_none());

        assert_eq!(list_all(&storage, "backups/").await.unwrap().len(), 3);
        assert!(list_all(&storage, "nothing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_batch_limits_and_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let storage = FsColdStorage::new(dir.path());
        storage.put("k/1", vec![1]).await.unwrap();
        storage.put("k/2", vec![2]).await.unwrap();

        storage
            .delete_batch(&["k/1".to_string(), "k/missing".to_string()])
            .await
            .unwrap();
        let left = list_all(&storage, "k/").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key, "k/2");

        let too_many: Vec<String> = (0..=MAX_DELETE_BATCH).map(|i| format!("k/{i}")).collect();
        assert!(matches!(
            storage.delete_batch(&too_many).await,
            Err(ColdStorageError::BatchTooLarge(1001))
        ));
    }
}
