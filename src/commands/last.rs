use anyhow::Result;
use serde_json::Value;

use crate::commands::{CommandReport, require_remote};
use crate::harvest::lock::LockRecord;
use crate::harvest::paths::{CollectionPaths, DEFAULT_COLLECTIONS_PATH, remote_key};
use crate::harvest::settings::load_settings;
use crate::harvest::stats::StatsSnapshot;
use crate::harvest::util::{human_size, parse_iso_timestamp};
use crate::remote::Remote;

/// Summarizes the most recent finished harvest straight from the remote store.
pub fn run(collection_id: &str, remote: Option<&str>) -> Result<CommandReport> {
    let settings = load_settings()?;
    let remote = require_remote(remote, &settings)?;
    describe_last(collection_id, &remote)
}

fn describe_last(collection_id: &str, remote: &Remote) -> Result<CommandReport> {
    let mut report = CommandReport::new("last");
    let root = std::path::Path::new(DEFAULT_COLLECTIONS_PATH);
    let paths = CollectionPaths::new(root, collection_id);
    let key = |path: &std::path::Path| remote_key(root, path);

    if let Some(lock) = remote.get_json::<LockRecord>(&key(&paths.lock_file()))? {
        report.detail(format!("locked by harvest {}", lock.harvest_id));
    }
    let Some(last) = remote.get_json::<LockRecord>(&key(&paths.last_harvest_file()))? else {
        report.detail(format!("{collection_id} has not been harvested"));
        return Ok(report);
    };
    report.detail(format!("last harvest={}", last.harvest_id));
    let harvest_timestamp = parse_iso_timestamp(&last.harvest_id)?;

    match remote.get_json::<StatsSnapshot>(&key(&paths.stats_file(&harvest_timestamp)))? {
        Some(stats) => {
            report.detail(format!(
                "items={} files={} bytes={}",
                stats.items,
                stats.files,
                human_size(stats.file_bytes)
            ));
            if let Some(end) = stats.harvest_end_timestamp {
                report.detail(format!("ended={end}"));
            }
        }
        None => report.issue(format!(
            "stats missing for harvest {}; the session may have failed",
            last.harvest_id
        )),
    }

    let changes_key = key(&paths.user_changes_file(&harvest_timestamp));
    if let Some(Value::Array(changes)) = remote.get_json::<Value>(&changes_key)? {
        for change in changes {
            let user_id = change.get("user_id").and_then(Value::as_str).unwrap_or("?");
            let what = change.get("change").and_then(Value::as_str).unwrap_or("?");
            report.detail(format!("user {user_id} {what}"));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use serde_json::json;

    #[test]
    fn reports_stats_and_user_changes() {
        let remote = Remote::new(MemoryStore::new());
        remote
            .put_json(
                "collections/foo/last_harvest.json",
                &json!({"harvest_id": "2019-03-10T13:57:52.123456"}),
            )
            .expect("put");
        remote
            .put_json(
                "collections/foo/harvests/2019/03/10/13/57/52/harvester.json",
                &json!({
                    "collection_id": "foo",
                    "harvest_timestamp": "2019-03-10T13:57:52.123456",
                    "items": 12,
                    "files": 1,
                    "file_bytes": 2048
                }),
            )
            .expect("put");
        remote
            .put_json(
                "collections/foo/harvests/2019/03/10/13/57/52/user_changes.json",
                &json!([{"user_id": "6253282", "change": "suspended"}]),
            )
            .expect("put");

        let report = describe_last("foo", &remote).expect("last");
        assert!(report.ok);
        assert_eq!(
            report.details,
            vec![
                "last harvest=2019-03-10T13:57:52.123456",
                "items=12 files=1 bytes=2.0K",
                "user 6253282 suspended",
            ]
        );
    }

    #[test]
    fn never_harvested_collection() {
        let remote = Remote::new(MemoryStore::new());
        let report = describe_last("foo", &remote).expect("last");
        assert_eq!(report.details, vec!["foo has not been harvested"]);
    }
}
