use crate::remote::BlobStore;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Mirrors keys as files under a root directory, e.g. a mounted bucket or NFS share.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                anyhow::bail!("invalid object key: {key}");
            }
            path.push(part);
        }
        Ok(path)
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, out)?;
                continue;
            }
            if path.to_string_lossy().ends_with(".part") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for DirStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // Readers never observe a partially written object.
        let staging = PathBuf::from(format!("{}.part", path.display()));
        fs::write(&staging, data)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("failed to move object into {}", path.display()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect(&self.root, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_list_delete() {
        let tmp = tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path());
        store
            .put("collections/foo/collection.json", b"{}")
            .expect("put");
        store
            .put("collections/foo/changesets/change-1.json", b"{}")
            .expect("put");
        store.put("collections/bar/collection.json", b"{}").expect("put");

        assert!(tmp.path().join("collections/foo/collection.json").is_file());
        assert_eq!(
            store.list("collections/foo/").expect("list"),
            vec![
                "collections/foo/changesets/change-1.json",
                "collections/foo/collection.json"
            ]
        );
        store.delete("collections/foo/collection.json").expect("delete");
        assert_eq!(store.get("collections/foo/collection.json").expect("get"), None);
        store.delete("collections/foo/collection.json").expect("idempotent");
    }

    #[test]
    fn rejects_escaping_keys() {
        let tmp = tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path());
        assert!(store.put("collections/../../etc/passwd", b"x").is_err());
    }

    #[test]
    fn listing_missing_root_is_empty() {
        let tmp = tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("absent"));
        assert!(store.list("").expect("list").is_empty());
    }
}
