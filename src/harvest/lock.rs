//! Cross-host mutual exclusion for a collection.
//!
//! The marker is `lock.json` in the collection directory, mirrored to the remote
//! store through the relay. A clean release renames it to `last_harvest.json`.

use crate::error::HarvestError;
use crate::harvest::paths::CollectionPaths;
use crate::harvest::relay::{FileQueue, FileRelay, write_json_file};
use crate::harvest::util::iso_timestamp;
use crate::remote::Remote;
use crate::remote::sync::sync_collection_config;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub harvest_id: String,
}

impl LockRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

pub fn is_locked(lock_file: &Path) -> bool {
    lock_file.is_file()
}

/// Fails with [`HarvestError::Locked`] when a marker is present.
pub fn reject_if_locked(paths: &CollectionPaths) -> Result<()> {
    let lock_file = paths.lock_file();
    if !is_locked(&lock_file) {
        return Ok(());
    }
    let harvest_id = LockRecord::load(&lock_file)
        .map(|record| record.harvest_id)
        .unwrap_or_else(|_| "unknown".to_string());
    Err(HarvestError::Locked {
        collection_id: paths.collection_id.clone(),
        harvest_id,
    }
    .into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    NotLocked,
    Released,
    Forced,
}

pub struct CollectionLock {
    paths: CollectionPaths,
    queue: FileQueue,
}

impl CollectionLock {
    pub fn new(paths: CollectionPaths, queue: FileQueue) -> Self {
        Self { paths, queue }
    }

    /// Writes the marker and enqueues its publish. The local copy stays in place.
    pub fn acquire(&self, harvest_timestamp: &NaiveDateTime) -> Result<()> {
        reject_if_locked(&self.paths)?;
        debug!(collection_id = %self.paths.collection_id, "locking");
        let record = LockRecord {
            harvest_id: iso_timestamp(harvest_timestamp),
        };
        write_json_file(&self.queue, &self.paths.lock_file(), &record)
    }

    pub fn release(&self, force: bool) -> Result<ReleaseOutcome> {
        let lock_file = self.paths.lock_file();
        if !is_locked(&lock_file) {
            warn!(collection_id = %self.paths.collection_id, "not locked");
            return Ok(ReleaseOutcome::NotLocked);
        }

        info!(collection_id = %self.paths.collection_id, force, "unlocking");
        let outcome = if force {
            fs::remove_file(&lock_file)
                .with_context(|| format!("failed to remove {}", lock_file.display()))?;
            ReleaseOutcome::Forced
        } else {
            let last = self.paths.last_harvest_file();
            fs::rename(&lock_file, &last).with_context(|| {
                format!("failed to move {} to {}", lock_file.display(), last.display())
            })?;
            self.queue.publish(last, false);
            ReleaseOutcome::Released
        };
        self.queue.remove(lock_file);
        Ok(outcome)
    }
}

/// Recovers a collection left locked by a crashed session.
pub fn force_unlock(
    local_root: &Path,
    collection_id: &str,
    remote: Option<Remote>,
) -> Result<ReleaseOutcome> {
    if let Some(remote) = &remote {
        sync_collection_config(local_root, collection_id, remote)?;
    }
    let (queue, relay) = FileRelay::spawn(local_root, remote)?;
    let lock = CollectionLock::new(CollectionPaths::new(local_root, collection_id), queue);
    let outcome = lock.release(true);
    relay.finish()?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::relay::FileOp;
    use crate::harvest::util::utc_now;
    use crate::remote::MemoryStore;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_clean_release() {
        let tmp = tempdir().expect("tempdir");
        let paths = CollectionPaths::new(tmp.path(), "foo");
        let (queue, rx) = FileQueue::unbounded();
        let lock = CollectionLock::new(paths.clone(), queue);

        let ts = utc_now();
        lock.acquire(&ts).expect("acquire");
        assert!(paths.lock_file().exists());
        assert_eq!(
            LockRecord::load(&paths.lock_file()).expect("record").harvest_id,
            iso_timestamp(&ts)
        );
        assert_eq!(
            rx.try_recv().expect("op"),
            FileOp::Publish {
                path: paths.lock_file(),
                delete_local: false
            }
        );

        let err = lock.acquire(&ts).expect_err("locked");
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::Locked { collection_id, .. }) if collection_id == "foo"
        ));

        assert_eq!(lock.release(false).expect("release"), ReleaseOutcome::Released);
        assert!(!paths.lock_file().exists());
        assert!(paths.last_harvest_file().exists());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                FileOp::Publish {
                    path: paths.last_harvest_file(),
                    delete_local: false
                },
                FileOp::Remove {
                    path: paths.lock_file()
                },
            ]
        );
    }

    #[test]
    fn forced_release_writes_no_record() {
        let tmp = tempdir().expect("tempdir");
        let paths = CollectionPaths::new(tmp.path(), "foo");
        let (queue, rx) = FileQueue::unbounded();
        let lock = CollectionLock::new(paths.clone(), queue);
        lock.acquire(&utc_now()).expect("acquire");
        let _ = rx.try_recv();

        assert_eq!(lock.release(true).expect("release"), ReleaseOutcome::Forced);
        assert!(!paths.lock_file().exists());
        assert!(!paths.last_harvest_file().exists());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![FileOp::Remove {
                path: paths.lock_file()
            }]
        );
    }

    #[test]
    fn releasing_unlocked_collection_is_noop() {
        let tmp = tempdir().expect("tempdir");
        let (queue, rx) = FileQueue::unbounded();
        let lock = CollectionLock::new(CollectionPaths::new(tmp.path(), "foo"), queue);
        assert_eq!(lock.release(false).expect("release"), ReleaseOutcome::NotLocked);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn force_unlock_clears_remote_marker() {
        let tmp = tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let remote = Remote::new(store.clone());
        remote
            .put_bytes("collections/foo/collection.json", br#"{"id":"foo"}"#)
            .expect("put");
        remote
            .put_json(
                "collections/foo/lock.json",
                &LockRecord {
                    harvest_id: "2019-03-10T13:57:52.432349".to_string(),
                },
            )
            .expect("put");

        let outcome = force_unlock(tmp.path(), "foo", Some(remote)).expect("unlock");
        assert_eq!(outcome, ReleaseOutcome::Forced);
        assert_eq!(store.keys(), vec!["collections/foo/collection.json"]);
        assert!(!tmp.path().join("foo/lock.json").exists());
    }
}
