//! Remote mirror of the collections tree.
//!
//! Stores are addressed by slash-separated keys rooted at `collections/`. The
//! harvester only needs whole-object get/put/delete and prefix listing.

pub mod dir;
pub mod http;
#[cfg(test)]
pub mod memory;
pub mod sync;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub use dir::DirStore;
pub use http::HttpStore;
#[cfg(test)]
pub use memory::MemoryStore;

pub trait BlobStore: Send + Sync + 'static {
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// `Ok(None)` when the object does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing object is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Every key beginning with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn describe(&self) -> String;
}

/// Shared handle to the configured store, passed to every component that needs it.
#[derive(Clone)]
pub struct Remote {
    store: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("store", &self.store.describe())
            .finish()
    }
}

impl Remote {
    pub fn new(store: impl BlobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Parses `dir:/path`, `http(s)://host/base`, or a bare directory path.
    pub fn open(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            anyhow::bail!("remote store spec cannot be empty");
        }
        if spec.starts_with("http://") || spec.starts_with("https://") {
            return Ok(Self::new(HttpStore::new(spec)?));
        }
        let dir = spec.strip_prefix("dir:").unwrap_or(spec);
        Ok(Self::new(DirStore::new(dir)))
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    #[cfg(test)]
    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(key)?.is_some())
    }

    pub fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.store
            .put(key, data)
            .with_context(|| format!("failed to put {key} to {}", self.describe()))
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store
            .get(key)
            .with_context(|| format!("failed to get {key} from {}", self.describe()))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .with_context(|| format!("failed to delete {key} from {}", self.describe()))
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.store
            .list(prefix)
            .with_context(|| format!("failed to list {prefix} in {}", self.describe()))
    }

    pub fn upload_file(&self, local_path: &Path, key: &str) -> Result<()> {
        let data = fs::read(local_path)
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        self.put_bytes(key, &data)
    }

    /// Downloads `key` to `local_path`; returns false when the object is missing.
    pub fn download_file(&self, key: &str, local_path: &Path) -> Result<bool> {
        let Some(data) = self.get_bytes(key)? else {
            return Ok(false);
        };
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(local_path, data)
            .with_context(|| format!("failed to write {}", local_path.display()))?;
        Ok(true)
    }

    #[cfg(test)]
    pub fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        self.put_bytes(key, &body)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(data) = self.get_bytes(key)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {key} from {}", self.describe()))?;
        Ok(Some(parsed))
    }
}
