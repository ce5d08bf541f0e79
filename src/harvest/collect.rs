//! The collection sub-task: drives an [`ItemSource`] for one collection type,
//! writes items to the archive, and records configuration changes it discovers.

use crate::collection::changeset::Changeset;
use crate::collection::config::{CollectionConfig, CollectionType};
use crate::harvest::archive::{ArchiveWriter, RolloverPolicy};
use crate::harvest::flag::Flag;
use crate::harvest::paths::CollectionPaths;
use crate::harvest::relay::{FileQueue, QueuedFile};
use crate::harvest::stats::HarvestStats;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub type ItemStream<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

/// Result of looking up one account. Only `Found` users are harvested.
#[derive(Debug, Clone, PartialEq)]
pub enum UserLookup {
    Found(Value),
    Protected,
    Suspended,
    NotFound,
}

impl UserLookup {
    /// Name recorded in `user_changes.json` and matched against `delete_users_for`.
    pub fn change(&self) -> Option<&'static str> {
        match self {
            Self::Found(_) => None,
            Self::Protected => Some("protected"),
            Self::Suspended => Some("suspended"),
            Self::NotFound => Some("not_found"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub track: Option<String>,
    pub follow: Option<String>,
    pub locations: Option<String>,
}

impl FilterCriteria {
    fn from_section(section: &Map<String, Value>) -> Self {
        let field = |name: &str| {
            section
                .get(name)
                .and_then(value_as_string)
                .filter(|v| !v.trim().is_empty())
        };
        Self {
            track: field("track"),
            follow: field("follow"),
            locations: field("locations"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.track.is_none() && self.follow.is_none() && self.locations.is_none()
    }
}

/// Upstream API client. Unrecognized upstream failures are errors, never lookup outcomes.
pub trait ItemSource: Send {
    fn lookup_user(&mut self, user_id: &str) -> Result<UserLookup>;

    fn user_timeline(&mut self, user_id: &str, since_id: Option<&str>) -> Result<ItemStream<'_>>;

    fn search(&mut self, query: &str, since_id: Option<&str>) -> Result<ItemStream<'_>>;

    /// Streams until exhausted or until `stop` is set.
    fn filter(&mut self, criteria: &FilterCriteria, stop: &Flag) -> Result<ItemStream<'_>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserChange {
    pub user_id: String,
    pub change: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
}

pub struct CollectTask {
    pub config: CollectionConfig,
    pub paths: CollectionPaths,
    pub harvest_timestamp: NaiveDateTime,
    pub queue: FileQueue,
    pub stats: Arc<HarvestStats>,
    pub policy: RolloverPolicy,
    pub stop: Flag,
}

impl CollectTask {
    /// Harvests into a fresh archive and returns the changeset with discovered changes.
    pub fn run(self, source: &mut dyn ItemSource, mut changeset: Changeset) -> Result<Changeset> {
        let collection_type = self
            .config
            .collection_type()
            .context("collection has no recognized type")?;
        debug!(collection_type = %collection_type, "starting collection task");

        let writer = ArchiveWriter::open(
            &self.paths,
            &self.harvest_timestamp,
            self.queue.clone(),
            Arc::clone(&self.stats),
            self.policy,
        )?;
        let collected = match collection_type {
            CollectionType::UserTimeline => self.user_timelines(source, &writer, &mut changeset),
            CollectionType::Search => self.search(source, &writer, &mut changeset),
            CollectionType::Filter => self.filter(source, &writer),
        };
        let closed = writer.close();
        collected?;
        closed?;

        self.stats.end();
        debug!("collection task finished");
        Ok(changeset)
    }

    fn user_timelines(
        &self,
        source: &mut dyn ItemSource,
        writer: &ArchiveWriter,
        changeset: &mut Changeset,
    ) -> Result<()> {
        let users = self
            .config
            .users()
            .cloned()
            .context("user_timeline collection has no users")?;
        let delete_for = self.config.delete_users_for();
        let mut changes = Vec::new();
        let mut users_file =
            QueuedFile::create(self.paths.users_file(&self.harvest_timestamp), &self.queue, true)?;

        let total = users.len();
        for (count, (user_id, details)) in users.iter().enumerate() {
            if self.stop.is_set() {
                break;
            }
            let known_name = details.get("screen_name").and_then(Value::as_str);
            let since_id = details.get("since_id").and_then(value_as_string);

            let user = match source.lookup_user(user_id)? {
                UserLookup::Found(user) => user,
                outcome => {
                    let change = outcome.change().unwrap_or("unknown");
                    changes.push(UserChange {
                        user_id: user_id.clone(),
                        change: change.to_string(),
                        screen_name: known_name.map(str::to_string),
                    });
                    if delete_for.iter().any(|d| d == change) {
                        changeset.delete_user(user_id);
                    }
                    continue;
                }
            };
            users_file.write_json_line(&user)?;

            if let Some(found_name) = user.get("screen_name").and_then(Value::as_str) {
                let change = match known_name {
                    None => Some("screen name found"),
                    Some(name) if name != found_name => Some("screen name changed"),
                    Some(_) => None,
                };
                if let Some(change) = change {
                    changes.push(UserChange {
                        user_id: user_id.clone(),
                        change: change.to_string(),
                        screen_name: Some(found_name.to_string()),
                    });
                    changeset.update_user("screen_name", Value::from(found_name), user_id);
                }
            }

            debug!(
                "collecting timeline of {} ({} of {total})",
                known_name.unwrap_or(user_id),
                count + 1
            );
            let new_max = self.user_timeline(source, writer, user_id, since_id.as_deref())?;
            if let Some(new_max) = new_max {
                if since_id.as_deref() != Some(new_max.as_str()) {
                    changeset.update_user("since_id", Value::from(new_max), user_id);
                }
            }
        }
        users_file.finish()?;

        let mut changes_file = QueuedFile::create(
            self.paths.user_changes_file(&self.harvest_timestamp),
            &self.queue,
            true,
        )?;
        changes_file.write_json_pretty(&changes)?;
        changes_file.finish()?;
        info!(users = total, changes = changes.len(), "user timelines collected");
        Ok(())
    }

    fn user_timeline(
        &self,
        source: &mut dyn ItemSource,
        writer: &ArchiveWriter,
        user_id: &str,
        since_id: Option<&str>,
    ) -> Result<Option<String>> {
        let mut max_id = since_id.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        for (count, item) in source.user_timeline(user_id, since_id)?.enumerate() {
            let item = item?;
            if count % 100 == 0 {
                debug!("collected {count} items for {user_id}");
            }
            writer.write(&item)?;
            max_id = max_id.max(item_id(&item).unwrap_or(0));
            if self.stop.is_set() {
                break;
            }
        }
        Ok((max_id > 0).then(|| max_id.to_string()))
    }

    fn search(
        &self,
        source: &mut dyn ItemSource,
        writer: &ArchiveWriter,
        changeset: &mut Changeset,
    ) -> Result<()> {
        let section = self
            .config
            .search()
            .context("search collection has no search section")?;
        let query = section
            .get("query")
            .and_then(value_as_string)
            .context("search collection has no query")?;
        let since_id = section.get("since_id").and_then(value_as_string);
        let max_records = max_records(section);

        let start = since_id.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let mut max_id = start;
        let mut count = 0u64;
        for item in source.search(&query, since_id.as_deref())? {
            let item = item?;
            if count % 1000 == 0 {
                debug!("collected {count} items");
            }
            writer.write(&item)?;
            count += 1;
            max_id = max_id.max(item_id(&item).unwrap_or(0));
            if self.stop.is_set() {
                break;
            }
            if max_records > 0 && count == max_records {
                debug!("reached max records of {max_records}");
                break;
            }
        }
        if max_id > start {
            changeset.update_search(&max_id.to_string());
        }
        info!(items = count, "search collected");
        Ok(())
    }

    fn filter(&self, source: &mut dyn ItemSource, writer: &ArchiveWriter) -> Result<()> {
        let section = self
            .config
            .filter()
            .context("filter collection has no filter section")?;
        let criteria = FilterCriteria::from_section(section);
        if criteria.is_empty() {
            anyhow::bail!("filter collection needs track, follow or locations");
        }
        let max_records = max_records(section);

        let mut count = 0u64;
        for item in source.filter(&criteria, &self.stop)? {
            let item = item?;
            if count % 1000 == 0 {
                debug!("collected {count} items");
            }
            writer.write(&item)?;
            count += 1;
            if max_records > 0 && count == max_records {
                debug!("reached max records of {max_records}");
                self.stop.set();
            }
            if self.stop.is_set() {
                break;
            }
        }
        info!(items = count, "filter collected");
        Ok(())
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn max_records(section: &Map<String, Value>) -> u64 {
    section
        .get("max_records")
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
        .unwrap_or(0)
}

/// Numeric item id, from `id` or `id_str`.
pub fn item_id(item: &Value) -> Option<u64> {
    item.get("id")
        .and_then(Value::as_u64)
        .or_else(|| item.get("id_str")?.as_str()?.parse().ok())
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;
    use crate::collection::config::fixtures::*;
    use crate::harvest::relay::FileOp;
    use crate::harvest::util::utc_now;
    use crossbeam::channel::Receiver;
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn task(config: CollectionConfig) -> (TempDir, CollectTask, Receiver<FileOp>) {
        let tmp = tempdir().expect("tempdir");
        let ts = utc_now();
        let (queue, rx) = FileQueue::unbounded();
        let task = CollectTask {
            config,
            paths: CollectionPaths::new(tmp.path(), "foo"),
            harvest_timestamp: ts,
            queue,
            stats: Arc::new(HarvestStats::new("foo", ts)),
            policy: RolloverPolicy::default(),
            stop: Flag::new(),
        };
        (tmp, task, rx)
    }

    fn tweet(id: u64) -> Value {
        json!({"id": id, "text": format!("tweet {id}")})
    }

    #[test]
    fn timelines_record_user_changes() {
        let mut config = timeline_config();
        config
            .as_map_mut()
            .insert("delete_users_for".into(), json!(["suspended"]));
        let (_tmp, task, _rx) = task(config);
        let stats = Arc::clone(&task.stats);
        let paths = task.paths.clone();
        let ts = task.harvest_timestamp;

        let mut source = ScriptedSource::default();
        source.users.insert(
            "481186914".into(),
            UserLookup::Found(json!({"id_str": "481186914", "screen_name": "real_justin_littman"})),
        );
        source.users.insert("6253282".into(), UserLookup::Suspended);
        source.users.insert(
            "12".into(),
            UserLookup::Found(json!({"id_str": "12", "screen_name": "jack"})),
        );
        source.timelines.insert("12".into(), vec![tweet(12346), tweet(12350)]);
        source
            .timelines
            .insert("481186914".into(), vec![tweet(900)]);

        let changeset = task.run(&mut source, Changeset::new()).expect("run");
        assert_eq!(stats.items.value(), 3);
        assert!(stats.ended());
        assert_eq!(
            source.seen_since_ids,
            vec![
                ("12".to_string(), Some("12345".to_string())),
                ("481186914".to_string(), None),
            ]
        );
        assert_eq!(
            Value::Object(changeset.update.clone()),
            json!({"users": {
                "12": {"since_id": "12350"},
                "481186914": {"screen_name": "real_justin_littman", "since_id": "900"}
            }})
        );
        assert_eq!(
            serde_json::to_value(&changeset.delete).expect("json"),
            json!([{"users": ["6253282"]}])
        );

        let changes: Value = serde_json::from_str(
            &fs::read_to_string(paths.user_changes_file(&ts)).expect("changes file"),
        )
        .expect("json");
        assert_eq!(
            changes,
            json!([
                {
                    "user_id": "481186914",
                    "change": "screen name changed",
                    "screen_name": "real_justin_littman"
                },
                {"user_id": "6253282", "change": "suspended", "screen_name": "twitterapi"}
            ])
        );
        let users = fs::read_to_string(paths.users_file(&ts)).expect("users file");
        assert_eq!(users.lines().count(), 2);
    }

    #[test]
    fn unchanged_cursor_is_not_recorded() {
        let (_tmp, task, _rx) = task(timeline_config());
        let mut source = ScriptedSource::default();
        for (id, name) in [
            ("481186914", "justin_littman"),
            ("6253282", "twitterapi"),
            ("12", "jack"),
        ] {
            source
                .users
                .insert(id.into(), UserLookup::Found(json!({"screen_name": name})));
        }
        let changeset = task.run(&mut source, Changeset::new()).expect("run");
        assert!(!changeset.has_changes());
    }

    #[test]
    fn search_advances_since_id_and_honours_max_records() {
        let mut config = search_config();
        config.as_map_mut()["search"] = json!({"query": "foo", "since_id": "10", "max_records": 2});
        let (_tmp, task, _rx) = task(config);
        let stats = Arc::clone(&task.stats);
        let mut source = ScriptedSource {
            search_items: vec![tweet(30), tweet(20), tweet(40)],
            ..Default::default()
        };
        let changeset = task.run(&mut source, Changeset::new()).expect("run");
        assert_eq!(stats.items.value(), 2);
        assert_eq!(
            Value::Object(changeset.update),
            json!({"search": {"since_id": "30"}})
        );
    }

    #[test]
    fn empty_search_leaves_changeset_alone() {
        let (_tmp, task, _rx) = task(search_config());
        let changeset = task
            .run(&mut ScriptedSource::default(), Changeset::new())
            .expect("run");
        assert!(!changeset.has_changes());
    }

    #[test]
    fn filter_stops_at_max_records() {
        let mut config = filter_config();
        config.as_map_mut()["filter"]["max_records"] = json!("3");
        let (_tmp, task, _rx) = task(config);
        let stop = task.stop.clone();
        let stats = Arc::clone(&task.stats);
        let mut source = ScriptedSource {
            filter_items: (1..=10).map(tweet).collect(),
            ..Default::default()
        };
        task.run(&mut source, Changeset::new()).expect("run");
        assert_eq!(stats.items.value(), 3);
        assert!(stop.is_set());
    }

    #[test]
    fn stop_ends_timelines_early() {
        let (_tmp, task, _rx) = task(timeline_config());
        task.stop.set();
        let stats = Arc::clone(&task.stats);
        let mut source = ScriptedSource::default();
        let changeset = task.run(&mut source, Changeset::new()).expect("run");
        assert_eq!(stats.items.value(), 0);
        assert!(source.seen_since_ids.is_empty());
        assert!(!changeset.has_changes());
    }

    #[test]
    fn upstream_failure_propagates_after_close() {
        let (_tmp, task, rx) = task(timeline_config());
        let stats = Arc::clone(&task.stats);
        let mut source = ScriptedSource {
            fail_timeline_for: Some("12".into()),
            ..Default::default()
        };
        source
            .users
            .insert("12".into(), UserLookup::Found(json!({"screen_name": "jack"})));
        let err = task.run(&mut source, Changeset::new()).expect_err("failure");
        assert!(format!("{err:#}").contains("upstream returned 500"));
        assert!(!stats.ended());
        // Nothing was written, so no archive was handed to the relay.
        assert!(rx.try_iter().all(|op| !matches!(
            op,
            FileOp::Publish { ref path, .. } if path.to_string_lossy().ends_with(".jsonl.gz")
        )));
    }

    #[test]
    fn item_ids_accept_both_forms() {
        assert_eq!(item_id(&json!({"id": 5})), Some(5));
        assert_eq!(item_id(&json!({"id_str": "7"})), Some(7));
        assert_eq!(item_id(&json!({})), None);
    }
}
