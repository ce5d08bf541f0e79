//! Offline [`ItemSource`] that replays a captured JSON-lines stream.
//!
//! Each line is one item carrying its author under `user`. Lookups, timelines,
//! searches and filters are answered from those items, so a collection can be
//! harvested end to end without network access.

use crate::harvest::collect::{FilterCriteria, ItemSource, ItemStream, UserLookup, item_id};
use crate::harvest::flag::Flag;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    items: Vec<Value>,
}

impl ReplaySource {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut items = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: Value = serde_json::from_str(&line)
                .with_context(|| format!("invalid item at {}:{}", path.display(), idx + 1))?;
            items.push(item);
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn id_floor(since_id: Option<&str>) -> u64 {
    since_id.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0)
}

fn author_id(item: &Value) -> Option<String> {
    let user = item.get("user")?;
    user.get("id_str")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| user.get("id").and_then(Value::as_u64).map(|id| id.to_string()))
}

fn text(item: &Value) -> String {
    item.get("full_text")
        .or_else(|| item.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn terms(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl ItemSource for ReplaySource {
    fn lookup_user(&mut self, user_id: &str) -> Result<UserLookup> {
        let latest = self
            .items
            .iter()
            .filter(|item| author_id(item).as_deref() == Some(user_id))
            .filter_map(|item| item.get("user"))
            .last();
        Ok(match latest {
            None => UserLookup::NotFound,
            Some(user) if user.get("suspended").and_then(Value::as_bool) == Some(true) => {
                UserLookup::Suspended
            }
            Some(user) if user.get("protected").and_then(Value::as_bool) == Some(true) => {
                UserLookup::Protected
            }
            Some(user) => UserLookup::Found(user.clone()),
        })
    }

    fn user_timeline(&mut self, user_id: &str, since_id: Option<&str>) -> Result<ItemStream<'_>> {
        let user_id = user_id.to_string();
        let floor = id_floor(since_id);
        Ok(Box::new(
            self.items
                .iter()
                .filter(move |item| author_id(item).as_deref() == Some(user_id.as_str()))
                .filter(move |item| item_id(item).unwrap_or(0) > floor)
                .cloned()
                .map(Ok),
        ))
    }

    fn search(&mut self, query: &str, since_id: Option<&str>) -> Result<ItemStream<'_>> {
        let wanted = terms(query, ' ');
        let floor = id_floor(since_id);
        Ok(Box::new(
            self.items
                .iter()
                .filter(move |item| {
                    let body = text(item);
                    wanted.iter().all(|term| body.contains(term.as_str()))
                })
                .filter(move |item| item_id(item).unwrap_or(0) > floor)
                .cloned()
                .map(Ok),
        ))
    }

    fn filter(&mut self, criteria: &FilterCriteria, stop: &Flag) -> Result<ItemStream<'_>> {
        let track = criteria.track.as_deref().map(|t| terms(t, ',')).unwrap_or_default();
        let follow = criteria.follow.as_deref().map(|f| terms(f, ',')).unwrap_or_default();
        let geo = criteria.locations.is_some();
        let stop = stop.clone();
        Ok(Box::new(
            self.items
                .iter()
                .take_while(move |_| !stop.is_set())
                .filter(move |item| {
                    let body = text(item);
                    let tracked = track.iter().any(|term| body.contains(term.as_str()));
                    let followed = author_id(item).is_some_and(|id| follow.contains(&id));
                    let located = geo
                        && item
                            .get("coordinates")
                            .is_some_and(|c| !c.is_null());
                    tracked || followed || located
                })
                .cloned()
                .map(Ok),
        ))
    }
}
