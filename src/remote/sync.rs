//! Pulls remote collection state into a local collections root.

use crate::error::HarvestError;
use crate::harvest::paths::{CollectionPaths, remote_key};
use crate::remote::Remote;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Replaces the local collection directory with the remote configuration and lock marker.
pub fn sync_collection_config(
    local_root: &Path,
    collection_id: &str,
    remote: &Remote,
) -> Result<()> {
    let paths = CollectionPaths::new(local_root, collection_id);
    let dir = paths.collection_dir();
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("failed to clear {}", dir.display())),
    }
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    sync_collection_config_file(local_root, collection_id, remote)?;

    let lock_file = paths.lock_file();
    if remote.download_file(&remote_key(local_root, &lock_file), &lock_file)? {
        debug!(collection_id, "remote lock marker present");
    }
    Ok(())
}

/// Refreshes only `collection.json`, leaving the rest of the local directory in place.
pub fn sync_collection_config_file(
    local_root: &Path,
    collection_id: &str,
    remote: &Remote,
) -> Result<()> {
    let config_file = CollectionPaths::new(local_root, collection_id).config_file();
    let key = remote_key(local_root, &config_file);
    if !remote.download_file(&key, &config_file)? {
        return Err(HarvestError::MissingCollection(collection_id.to_string()).into());
    }
    Ok(())
}

/// Downloads changesets not already present locally; `clean` discards local ones first.
pub fn sync_changesets(
    local_root: &Path,
    collection_id: &str,
    remote: &Remote,
    clean: bool,
) -> Result<usize> {
    let dir = CollectionPaths::new(local_root, collection_id).changesets_dir();
    if clean && dir.exists() {
        fs::remove_dir_all(&dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let prefix = format!("{}/", remote_key(local_root, &dir));
    let mut fetched = 0usize;
    for key in remote.list(&prefix)? {
        let Some(name) = key.rsplit('/').next() else {
            continue;
        };
        let dest = dir.join(name);
        if dest.exists() {
            continue;
        }
        if remote.download_file(&key, &dest)? {
            fetched += 1;
        }
    }
    Ok(fetched)
}
