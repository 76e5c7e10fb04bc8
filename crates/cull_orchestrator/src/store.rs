//! Byte-oriented chunk storage.
//!
//! The pipeline needs exactly four operations from its backing store:
//! existence check, get, put and list-by-prefix. Keys are opaque
//! `/`-separated strings; implementations must make `put` atomic so a
//! reader never observes a partially written value under its final key.

use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ChunkStore: Debug + Send + Sync {
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Returns [`StoreError::NotFound`] for a missing key.
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Idempotent: re-putting identical content is safe.
    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Every key starting with `prefix`. Order is unspecified.
    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[async_trait]
impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        (**self).exists(key).await
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        (**self).put(key, bytes).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        (**self).list_by_prefix(prefix).await
    }
}

/// In-process store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Snapshot of every key/value pair, sorted by key.
    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.data.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Directory-backed store: key `a/b-3` lives at `{root}/a/b-3`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Relative keys only; no `..`, no empty segments.
    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.split('/').any(|seg| seg.is_empty() || seg.starts_with('.'))
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

#[async_trait]
impl ChunkStore for FsStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::io(key, e)
            }
        })
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        // Dot-prefixed temp names are invisible to listing and to `resolve`.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(key, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(key, e));
        }
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // Walk only the directory holding the prefix's last segment.
        let dir = match prefix.rfind('/') {
            Some(i) => self.resolve(&prefix[..i])?,
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let this = self.clone();
        let prefix = prefix.to_string();
        let listed = tokio::task::spawn_blocking(move || -> StoreResult<Vec<String>> {
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&dir) {
                let entry = entry.map_err(|e| {
                    let key = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| prefix.clone());
                    StoreError::io(key, e.into())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_str().map_or(true, |n| n.starts_with('.')) {
                    continue;
                }
                if let Some(key) = this.key_of(entry.path()) {
                    if key.starts_with(&prefix) {
                        keys.push(key);
                    }
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::io(self.root.display().to_string(), std::io::Error::other(e)))??;

        Ok(listed)
    }
}
