//! Structural deltas between two collection configurations.
//!
//! A changeset holds `update`, a partial document of added or changed leaves, and
//! `delete`, a list of removals. A delete entry is either the key of a direct child
//! or a single-key mapping from a parent key to a nested delete list, so shared
//! ancestors are written once:
//!
//! ```text
//! "delete": [{"users": ["6253282", {"12": ["since_id"]}]}]
//! ```

use crate::collection::config::{CollectionConfig, CollectionType};
use crate::error::HarvestError;
use crate::harvest::util::{iso_timestamp, parse_iso_timestamp, utc_now};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeleteEntry {
    Key(String),
    Nested(BTreeMap<String, Vec<DeleteEntry>>),
}

impl DeleteEntry {
    fn nested(key: &str, children: Vec<DeleteEntry>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), children);
        Self::Nested(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub update: Map<String, Value>,
    pub delete: Vec<DeleteEntry>,
    pub change_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Default for Changeset {
    fn default() -> Self {
        Self::new()
    }
}

impl Changeset {
    pub fn new() -> Self {
        Self::at(&utc_now())
    }

    pub fn at(change_timestamp: &NaiveDateTime) -> Self {
        Self {
            update: Map::new(),
            delete: Vec::new(),
            change_timestamp: iso_timestamp(change_timestamp),
            harvest_timestamp: None,
            note: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn change_time(&self) -> Result<NaiveDateTime> {
        parse_iso_timestamp(&self.change_timestamp)
    }

    pub fn has_changes(&self) -> bool {
        !self.update.is_empty() || !self.delete.is_empty()
    }

    /// Records a new or changed field for a user.
    pub fn update_user(&mut self, key: &str, value: Value, user_id: &str) {
        let users = child_object(&mut self.update, "users");
        let user = child_object(users, user_id);
        user.insert(key.to_string(), value);
    }

    /// Records the removal of a user, grouped under a single `users` delete entry.
    pub fn delete_user(&mut self, user_id: &str) {
        for entry in &mut self.delete {
            if let DeleteEntry::Nested(map) = entry {
                if let Some(users) = map.get_mut("users") {
                    users.push(DeleteEntry::Key(user_id.to_string()));
                    return;
                }
            }
        }
        self.delete.push(DeleteEntry::nested(
            "users",
            vec![DeleteEntry::Key(user_id.to_string())],
        ));
    }

    pub fn update_search(&mut self, since_id: &str) {
        let search = child_object(&mut self.update, "search");
        search.insert("since_id".to_string(), Value::from(since_id));
    }

    /// Drops user updates for users that are no longer part of `latest`.
    ///
    /// Covers the race where an operator removed a user while a running harvest
    /// discovered changes for the same user. Only `users` is pruned.
    pub fn clean(&mut self, latest: &CollectionConfig) {
        let Some(Value::Object(users)) = self.update.get_mut("users") else {
            return;
        };
        let known = latest.users();
        users.retain(|user_id, _| known.is_some_and(|known| known.contains_key(user_id)));
        if users.is_empty() {
            self.update.remove("users");
        }
    }
}

fn child_object<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

impl CollectionConfig {
    /// Changeset that turns `self` into `new`, limited to `keys` and the type's section.
    pub fn diff(&self, new: &CollectionConfig) -> Result<Changeset, HarvestError> {
        let reasons = new.invalid_reasons();
        if !reasons.is_empty() {
            return Err(HarvestError::ChangesetInvalid(format!(
                "New configuration is not valid: {}",
                reasons.join(" ")
            )));
        }
        if self.id() != new.id() {
            return Err(HarvestError::ChangesetInvalid(
                "Collection id may not change.".to_string(),
            ));
        }
        if self.type_name() != new.type_name() {
            return Err(HarvestError::ChangesetInvalid(
                "Collection type may not change.".to_string(),
            ));
        }

        let mut changeset = Changeset::new();
        let scoped: Vec<&str> = match new.collection_type() {
            Some(collection_type) => scoped_sections(collection_type).to_vec(),
            None => vec!["keys"],
        };
        for key in scoped {
            diff_scoped(self.as_map(), new.as_map(), key, &mut changeset);
        }
        Ok(changeset)
    }

    /// Applies `changeset` in place and stamps the configuration with its change time.
    pub fn merge_changeset(&mut self, changeset: &Changeset) {
        merge_update(self.as_map_mut(), &changeset.update);
        merge_delete(self.as_map_mut(), &changeset.delete);
        self.set_timestamp(&changeset.change_timestamp);
    }
}

fn diff_scoped(old: &Map<String, Value>, new: &Map<String, Value>, key: &str, out: &mut Changeset) {
    match (old.get(key), new.get(key)) {
        (Some(Value::Object(old_child)), Some(Value::Object(new_child))) => {
            let update = diff_update(old_child, new_child);
            if !update.is_empty() {
                out.update.insert(key.to_string(), Value::Object(update));
            }
            let deletes = diff_deletes(old_child, new_child);
            if !deletes.is_empty() {
                out.delete.push(DeleteEntry::nested(key, deletes));
            }
        }
        (Some(old_value), Some(new_value)) => {
            if old_value != new_value {
                out.update.insert(key.to_string(), new_value.clone());
            }
        }
        (None, Some(new_value)) => {
            out.update.insert(key.to_string(), new_value.clone());
        }
        (Some(_), None) => out.delete.push(DeleteEntry::Key(key.to_string())),
        (None, None) => {}
    }
}

fn diff_update(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut update = Map::new();
    for (key, new_value) in new {
        match (old.get(key), new_value) {
            (Some(Value::Object(old_child)), Value::Object(new_child)) => {
                let child = diff_update(old_child, new_child);
                if !child.is_empty() {
                    update.insert(key.clone(), Value::Object(child));
                }
            }
            (Some(old_value), _) if old_value == new_value => {}
            _ => {
                update.insert(key.clone(), new_value.clone());
            }
        }
    }
    update
}

fn diff_deletes(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<DeleteEntry> {
    let mut deletes = Vec::new();
    for (key, old_value) in old {
        match (old_value, new.get(key)) {
            (_, None) => deletes.push(DeleteEntry::Key(key.clone())),
            (Value::Object(old_child), Some(Value::Object(new_child))) => {
                let child = diff_deletes(old_child, new_child);
                if !child.is_empty() {
                    deletes.push(DeleteEntry::nested(key, child));
                }
            }
            _ => {}
        }
    }
    deletes
}

fn merge_update(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match value {
            Value::Object(child_update) => {
                let child = child_object(target, key);
                merge_update(child, child_update);
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

fn merge_delete(target: &mut Map<String, Value>, deletes: &[DeleteEntry]) {
    for entry in deletes {
        match entry {
            DeleteEntry::Key(key) => {
                target.remove(key);
            }
            DeleteEntry::Nested(map) => {
                for (key, children) in map {
                    if let Some(Value::Object(child)) = target.get_mut(key) {
                        merge_delete(child, children);
                    }
                }
            }
        }
    }
}

/// Sections a changeset may touch for a collection type.
pub fn scoped_sections(collection_type: CollectionType) -> [&'static str; 2] {
    ["keys", collection_type.section()]
}
