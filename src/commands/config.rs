use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::collection::changeset::Changeset;
use crate::collection::config::{CollectionConfig, CollectionType, config_template};
use crate::collection::describe::{DescribeOptions, describe_changes};
use crate::commands::{CommandReport, collections_root, require_remote};
use crate::error::{HarvestError, find_harvest_error};
use crate::harvest::lock::reject_if_locked;
use crate::harvest::paths::CollectionPaths;
use crate::harvest::relay::{FileRelay, write_json_file};
use crate::harvest::settings::load_settings;
use crate::remote::Remote;
use crate::remote::sync::{sync_changesets, sync_collection_config};

const UPDATE_NOTE: &str = "Changes based on update.";

pub fn template(collection_type: &str, collection_id: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("config template");
    let Some(collection_type) = CollectionType::parse(collection_type) else {
        report.issue(format!(
            "unknown collection type `{collection_type}`; use user_timeline, filter or search"
        ));
        return Ok(report);
    };
    let template = config_template(collection_type, collection_id);
    report.detail(serde_json::to_string_pretty(&template)?);
    Ok(report)
}

pub fn validate(file: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("config validate");
    let config = CollectionConfig::load(file)?;
    let reasons = config.invalid_reasons();
    if reasons.is_empty() {
        report.detail(format!("{} is valid", file.display()));
    }
    for reason in reasons {
        report.issue(reason);
    }
    Ok(report)
}

/// Pushes a new or edited configuration to the remote store with a changeset.
pub fn update(
    file: &Path,
    remote: Option<&str>,
    collections_path: Option<PathBuf>,
    force: bool,
) -> Result<CommandReport> {
    let settings = load_settings()?;
    let remote = require_remote(remote, &settings)?;
    let root = collections_root(collections_path.as_deref(), &settings);
    apply_update(file, remote, &root, force)
}

fn apply_update(file: &Path, remote: Remote, root: &Path, force: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("config update");
    let new = CollectionConfig::load(file)?;
    if let Err(err) = new.validate() {
        report.absorb(err.into())?;
        return Ok(report);
    }
    let collection_id = new.id().context("collection has no id")?.to_string();
    let collection_type = new
        .collection_type()
        .context("collection has no recognized type")?;
    let paths = CollectionPaths::new(root, &collection_id);

    let existing = match sync_collection_config(root, &collection_id, &remote) {
        Ok(()) => Some(CollectionConfig::load(&paths.config_file())?),
        Err(err)
            if matches!(
                find_harvest_error(&err),
                Some(HarvestError::MissingCollection(_))
            ) =>
        {
            None
        }
        Err(err) => return Err(err),
    };
    if let Err(err) = reject_if_locked(&paths) {
        report.absorb(err)?;
        return Ok(report);
    }

    let base = existing
        .clone()
        .unwrap_or_else(|| CollectionConfig::empty(&collection_id, collection_type));
    let mut changeset = match base.diff(&new) {
        Ok(changeset) => changeset,
        Err(err) => {
            report.absorb(err.into())?;
            return Ok(report);
        }
    };
    if !changeset.has_changes() {
        report.detail(HarvestError::NoChanges.to_string());
        return Ok(report);
    }
    changeset.note = Some(UPDATE_NOTE.to_string());

    // The stored timestamp moves whenever a harvest or another update merges changes.
    let stored = existing.as_ref().and_then(|c| c.timestamp().map(str::to_string));
    if let Some(stored) = stored {
        if !force && new.timestamp() != Some(stored.as_str()) {
            report.detail(format!(
                "changes that would be applied:\n{}",
                serde_json::to_string_pretty(&changeset)?
            ));
            report.detail("rerun with --force to apply them over the stored configuration");
            let stale = HarvestError::StaleConfig {
                collection_id,
                stored,
                submitted: new.timestamp().map(str::to_string),
            };
            report.absorb(stale.into())?;
            return Ok(report);
        }
    }

    let merged = match existing {
        Some(mut existing) => {
            existing.merge_changeset(&changeset);
            existing
        }
        None => {
            report.detail(format!("creating collection {collection_id}"));
            let mut created = new;
            created.set_timestamp(&changeset.change_timestamp);
            created
        }
    };
    let changeset_file = persist(root, &paths, &merged, &changeset, remote)?;
    report.detail(format!("changeset={}", changeset_file.display()));
    merged.save(file)?;
    report.detail(format!(
        "updated {} to timestamp {}",
        file.display(),
        changeset.change_timestamp
    ));
    Ok(report)
}

fn persist(
    root: &Path,
    paths: &CollectionPaths,
    config: &CollectionConfig,
    changeset: &Changeset,
    remote: Remote,
) -> Result<PathBuf> {
    let (queue, relay) = FileRelay::spawn(root, Some(remote))?;
    let changeset_file = paths.changeset_file(&changeset.change_time()?);
    let written = write_json_file(&queue, &paths.config_file(), &config.to_value())
        .and_then(|()| write_json_file(&queue, &changeset_file, changeset));
    let relayed = relay.finish();
    written?;
    relayed?;
    Ok(changeset_file)
}

pub fn changes(
    collection_id: &str,
    remote: Option<&str>,
    collections_path: Option<PathBuf>,
    deletes_only: bool,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("config changes");
    let settings = load_settings()?;
    let remote = require_remote(remote, &settings)?;
    let root = collections_root(collections_path.as_deref(), &settings);

    let fetched = sync_changesets(&root, collection_id, &remote, true)?;
    let options = DescribeOptions {
        deletes_only,
        ..DescribeOptions::default()
    };
    let dir = CollectionPaths::new(&root, collection_id).changesets_dir();
    let lines = describe_changes(&dir, &options)?;
    if lines.is_empty() {
        report.detail(format!("no changes recorded in {fetched} changesets"));
    }
    for line in lines {
        report.detail(line);
    }
    Ok(report)
}

pub fn user_ids(file: &Path, user_ids: &[String]) -> Result<CommandReport> {
    let mut report = CommandReport::new("config user-ids");
    let mut config = CollectionConfig::load(file)?;
    if config.collection_type() != Some(CollectionType::UserTimeline) {
        report.issue("user ids can only be added to a user_timeline collection");
        return Ok(report);
    }
    let added = config.add_user_ids(user_ids);
    config.save(file)?;
    report.detail(format!("added {added} users to {}", file.display()));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::config::fixtures::timeline_config;
    use crate::harvest::paths::remote_key;
    use crate::remote::MemoryStore;
    use serde_json::{Value, json};
    use tempfile::tempdir;

    #[test]
    fn user_ids_skip_existing_users() {
        let tmp = tempdir().expect("tempdir");
        let file = tmp.path().join("collection.json");
        timeline_config().save(&file).expect("save");

        let report =
            user_ids(&file, &["12".to_string(), "783214".to_string()]).expect("user ids");
        assert!(report.ok);
        assert_eq!(report.details, vec![format!("added 1 users to {}", file.display())]);
        let config = CollectionConfig::load(&file).expect("load");
        assert!(config.users().expect("users").contains_key("783214"));
    }

    #[test]
    fn persist_publishes_config_and_changeset() {
        let tmp = tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let paths = CollectionPaths::new(tmp.path(), "foo");
        let base = timeline_config();
        let mut new = base.clone();
        new.as_map_mut()
            .insert("users".into(), json!({"12": {"screen_name": "jack"}}));
        let changeset = base.diff(&new).expect("diff");
        let mut merged = base.clone();
        merged.merge_changeset(&changeset);

        let file = persist(tmp.path(), &paths, &merged, &changeset, Remote::new(store.clone()))
            .expect("persist");
        let keys = store.keys();
        assert!(keys.contains(&remote_key(tmp.path(), &paths.config_file())));
        assert!(keys.contains(&remote_key(tmp.path(), &file)));
    }

    const STORED: &str = "2019-03-11T12:00:00.000000";
    const STALE: &str = "2019-03-01T12:00:00.000000";

    fn stored_config() -> CollectionConfig {
        let mut config = timeline_config();
        config.as_map_mut()["users"]["12"]["since_id"] = json!("500");
        config.set_timestamp(STORED);
        config
    }

    fn seed_remote(root: &Path, config: &CollectionConfig) -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let key = remote_key(root, &CollectionPaths::new(root, "foo").config_file());
        Remote::new(store.clone())
            .put_json(&key, &config.to_value())
            .expect("seed remote");
        (store, key)
    }

    fn stored_since_id(store: &MemoryStore, key: &str) -> Value {
        let stored: Value = Remote::new(store.clone())
            .get_json(key)
            .expect("get")
            .expect("config");
        stored["users"]["12"]["since_id"].clone()
    }

    #[test]
    fn stale_copy_is_refused_without_force() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("work");
        let (store, key) = seed_remote(&root, &stored_config());

        let mut local = stored_config();
        local.as_map_mut()["users"]["12"]["since_id"] = json!("100");
        local.add_user_ids(["783214"]);
        local.set_timestamp(STALE);
        let file = tmp.path().join("foo.json");
        local.save(&file).expect("save");

        let report =
            apply_update(&file, Remote::new(store.clone()), &root, false).expect("update");
        assert!(!report.ok);
        assert!(report.issues[0].starts_with("[E006_STALE_CONFIG]"));
        assert!(report.issues[0].contains(STORED));
        assert_eq!(stored_since_id(&store, &key), json!("500"));
        let untouched = CollectionConfig::load(&file).expect("load");
        assert_eq!(untouched.timestamp(), Some(STALE));

        let report = apply_update(&file, Remote::new(store.clone()), &root, true).expect("force");
        assert!(report.ok);
        assert_eq!(stored_since_id(&store, &key), json!("100"));
        let stamped = CollectionConfig::load(&file).expect("load");
        assert_ne!(stamped.timestamp(), Some(STALE));
        assert_ne!(stamped.timestamp(), Some(STORED));
    }

    #[test]
    fn current_copy_updates_and_is_restamped() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("work");
        let (store, key) = seed_remote(&root, &stored_config());

        let mut local = stored_config();
        local.add_user_ids(["783214"]);
        let file = tmp.path().join("foo.json");
        local.save(&file).expect("save");

        let report =
            apply_update(&file, Remote::new(store.clone()), &root, false).expect("update");
        assert!(report.ok, "{:?}", report.issues);
        assert_eq!(stored_since_id(&store, &key), json!("500"));

        let stored: Value = Remote::new(store.clone())
            .get_json(&key)
            .expect("get")
            .expect("config");
        assert!(stored["users"].get("783214").is_some());
        let stamped = CollectionConfig::load(&file).expect("load");
        assert_eq!(stamped.timestamp(), stored["timestamp"].as_str());
        assert_ne!(stamped.timestamp(), Some(STORED));

        let again = apply_update(&file, Remote::new(store), &root, false).expect("again");
        assert!(again.ok);
        assert_eq!(again.details, vec![HarvestError::NoChanges.to_string()]);
    }
}
