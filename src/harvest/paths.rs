use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Root used for collections inside the remote store, and the local default.
pub const DEFAULT_COLLECTIONS_PATH: &str = "collections";

pub const COLLECTION_CONFIG_FILE: &str = "collection.json";
pub const LOCK_FILE: &str = "lock.json";
pub const LAST_HARVEST_FILE: &str = "last_harvest.json";
pub const MANIFEST_FILE: &str = "manifest-sha1.txt";
pub const STATS_FILE: &str = "harvester.json";
pub const USERS_FILE: &str = "users.jsonl";
pub const USER_CHANGES_FILE: &str = "user_changes.json";

/// Every per-collection path, relative to a collections root.
#[derive(Debug, Clone)]
pub struct CollectionPaths {
    pub root: PathBuf,
    pub collection_id: String,
}

impl CollectionPaths {
    pub fn new(root: impl Into<PathBuf>, collection_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            collection_id: collection_id.into(),
        }
    }

    pub fn collection_dir(&self) -> PathBuf {
        self.root.join(&self.collection_id)
    }

    pub fn config_file(&self) -> PathBuf {
        self.collection_dir().join(COLLECTION_CONFIG_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.collection_dir().join(LOCK_FILE)
    }

    pub fn last_harvest_file(&self) -> PathBuf {
        self.collection_dir().join(LAST_HARVEST_FILE)
    }

    pub fn changesets_dir(&self) -> PathBuf {
        self.collection_dir().join("changesets")
    }

    pub fn changeset_file(&self, change_timestamp: &NaiveDateTime) -> PathBuf {
        self.changesets_dir().join(format!(
            "change-{}.json",
            change_timestamp.format("%Y%m%d%H%M%S")
        ))
    }

    pub fn harvest_dir(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.collection_dir()
            .join("harvests")
            .join(harvest_timestamp.format("%Y/%m/%d/%H/%M/%S").to_string())
    }

    pub fn harvest_file(&self, harvest_timestamp: &NaiveDateTime, name: &str) -> PathBuf {
        self.harvest_dir(harvest_timestamp).join(name)
    }

    pub fn manifest_file(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.harvest_file(harvest_timestamp, MANIFEST_FILE)
    }

    pub fn stats_file(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.harvest_file(harvest_timestamp, STATS_FILE)
    }

    pub fn harvest_config_file(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.harvest_file(harvest_timestamp, COLLECTION_CONFIG_FILE)
    }

    pub fn users_file(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.harvest_file(harvest_timestamp, USERS_FILE)
    }

    pub fn user_changes_file(&self, harvest_timestamp: &NaiveDateTime) -> PathBuf {
        self.harvest_file(harvest_timestamp, USER_CHANGES_FILE)
    }
}

/// Maps a local path under `local_root` to its key under the canonical remote root.
pub fn remote_key(local_root: &Path, local_path: &Path) -> String {
    let relative = local_path.strip_prefix(local_root).unwrap_or(local_path);
    let mut key = String::from(DEFAULT_COLLECTIONS_PATH);
    for component in relative.components() {
        key.push('/');
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}
