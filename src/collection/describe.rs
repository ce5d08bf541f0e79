use crate::collection::changeset::{Changeset, DeleteEntry};
use crate::collection::config::CollectionConfig;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DescribeOptions {
    pub ignore_keys: Vec<String>,
    pub deletes_only: bool,
}

impl Default for DescribeOptions {
    fn default() -> Self {
        Self {
            ignore_keys: vec!["since_id".to_string()],
            deletes_only: false,
        }
    }
}

impl DescribeOptions {
    fn ignored(&self, key: &str) -> bool {
        self.ignore_keys.iter().any(|k| k == key)
    }
}

fn changeset_files(changesets_dir: &Path) -> Result<Vec<PathBuf>> {
    if !changesets_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = fs::read_dir(changesets_dir)
        .with_context(|| format!("failed to read {}", changesets_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("change-") && n.ends_with(".json"))
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Replays every stored changeset, oldest first, and renders one line per change.
pub fn describe_changes(changesets_dir: &Path, options: &DescribeOptions) -> Result<Vec<String>> {
    let mut changesets = Vec::new();
    for path in changeset_files(changesets_dir)? {
        changesets.push(Changeset::load(&path)?);
    }
    Ok(describe_changesets(&changesets, options))
}

pub fn describe_changesets(changesets: &[Changeset], options: &DescribeOptions) -> Vec<String> {
    let mut config = CollectionConfig::from_map(Map::new());
    let mut lines = Vec::new();
    for changeset in changesets {
        let ts = changeset.change_timestamp.as_str();
        if !options.deletes_only {
            for (key, value) in &changeset.update {
                describe_update(key, value, Some(config.as_map()), &[], ts, options, &mut lines);
            }
        }
        for entry in &changeset.delete {
            describe_delete(entry, Some(config.as_map()), &[], ts, options, &mut lines);
        }
        config.merge_changeset(changeset);
    }
    lines
}

fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "(unset)".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn joined(path: &[&str]) -> String {
    path.join(" -> ")
}

fn describe_update(
    key: &str,
    value: &Value,
    current: Option<&Map<String, Value>>,
    ancestors: &[&str],
    ts: &str,
    options: &DescribeOptions,
    out: &mut Vec<String>,
) {
    let mut path = ancestors.to_vec();
    path.push(key);
    let existing = current.and_then(|map| map.get(key));
    match value {
        Value::Object(children) => {
            let nested = existing.and_then(Value::as_object);
            for (child_key, child_value) in children {
                describe_update(child_key, child_value, nested, &path, ts, options, out);
            }
        }
        leaf if !options.ignored(key) => out.push(format!(
            "{} changed from {} to {} on {ts}",
            joined(&path),
            render(existing),
            render(Some(leaf)),
        )),
        _ => {}
    }
}

fn describe_delete(
    entry: &DeleteEntry,
    current: Option<&Map<String, Value>>,
    ancestors: &[&str],
    ts: &str,
    options: &DescribeOptions,
    out: &mut Vec<String>,
) {
    match entry {
        DeleteEntry::Nested(map) => {
            for (key, children) in map {
                let mut path = ancestors.to_vec();
                path.push(key);
                let nested = current.and_then(|m| m.get(key)).and_then(Value::as_object);
                for child in children {
                    describe_delete(child, nested, &path, ts, options, out);
                }
            }
        }
        DeleteEntry::Key(key) if !options.ignored(key) => {
            let mut path = ancestors.to_vec();
            path.push(key);
            match current.and_then(|m| m.get(key)) {
                Some(Value::Object(removed)) => {
                    for (child_key, child_value) in removed {
                        if options.ignored(child_key) {
                            continue;
                        }
                        let mut child_path = path.clone();
                        child_path.push(child_key);
                        out.push(format!(
                            "{} deleted with value {} on {ts}",
                            joined(&child_path),
                            render(Some(child_value)),
                        ));
                    }
                }
                other => out.push(format!(
                    "{} deleted with value {} on {ts}",
                    joined(&path),
                    render(other),
                )),
            }
        }
        DeleteEntry::Key(_) => {}
    }
}
