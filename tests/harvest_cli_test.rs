use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn harvester(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("harvester");
    cmd.current_dir(home)
        .env("HARVESTER_HOME", home)
        .env("HARVESTER_CONFIG_PATH", home.join("absent.toml"))
        .env_remove("HARVESTER_REMOTE")
        .env_remove("HARVESTER_COLLECTIONS_PATH");
    cmd
}

fn timeline_config() -> Value {
    json!({
        "id": "foo",
        "type": "user_timeline",
        "keys": {
            "consumer_key": "mBbq9ruEckInQHUir8Kn0",
            "consumer_secret": "Pf28yReBUD90pLVOsb4r5ZnKCQ6xlOomBAjD5npFEQ6Rm",
            "access_token": "481186914-5yIyfryJqcHV29YVL37BOzjseYuRzCLmwO6",
            "access_token_secret": "S51yY5Hjffts4WMKMgvGendxbZVsZO014Z38Tfvc"
        },
        "users": {"481186914": {}}
    })
}

fn write_json(path: &Path, value: &Value) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, serde_json::to_string_pretty(value).expect("json")).expect("write json");
}

fn write_items(path: &Path) {
    let justin = json!({"id_str": "481186914", "screen_name": "real_justin_littman"});
    let items = [
        json!({"id": 101, "text": "first", "user": justin}),
        json!({"id": 102, "text": "second", "user": justin}),
        json!({"id": 103, "text": "someone else", "user": {"id_str": "12", "screen_name": "jack"}}),
    ];
    let body = items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, body).expect("write items");
}

fn files_named(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_named(&path, suffix));
        } else if path.to_string_lossy().ends_with(suffix) {
            found.push(path);
        }
    }
    found
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("parse")
}

#[test]
fn local_harvest_merges_discovered_screen_name() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("collections");
    write_json(&root.join("foo/collection.json"), &timeline_config());
    let items = tmp.path().join("items.jsonl");
    write_items(&items);

    harvester(tmp.path())
        .arg("harvest")
        .arg("foo")
        .arg("--source")
        .arg(&items)
        .arg("--collections-path")
        .arg(&root)
        .assert()
        .success()
        .stdout(predicates::str::contains("items=2 files=1"));

    let merged = read_json(&root.join("foo/collection.json"));
    assert_eq!(
        merged["users"]["481186914"]["screen_name"],
        "real_justin_littman"
    );
    assert_eq!(files_named(&root.join("foo/changesets"), ".json").len(), 1);
    assert!(root.join("foo/last_harvest.json").exists());
    assert!(!root.join("foo/lock.json").exists());

    let harvests = root.join("foo/harvests");
    assert_eq!(files_named(&harvests, ".jsonl.gz").len(), 1);
    let manifest = files_named(&harvests, "manifest-sha1.txt");
    assert_eq!(manifest.len(), 1);
    let line = fs::read_to_string(&manifest[0]).expect("manifest");
    assert!(line.trim_end().contains("  tweets-"));

    let scrubbed = files_named(&harvests, "collection.json");
    assert_eq!(scrubbed.len(), 1);
    let copy = read_json(&scrubbed[0]);
    assert!(copy["keys"].get("consumer_secret").is_none());
    assert!(copy["keys"].get("access_token_secret").is_none());
}

#[test]
fn remote_harvest_mirrors_into_directory_store() {
    let tmp = tempdir().expect("tempdir");
    let store = tmp.path().join("store");
    let root = tmp.path().join("work");
    write_json(&store.join("collections/foo/collection.json"), &timeline_config());
    let items = tmp.path().join("items.jsonl");
    write_items(&items);

    harvester(tmp.path())
        .arg("harvest")
        .arg("foo")
        .arg("--source")
        .arg(&items)
        .arg("--collections-path")
        .arg(&root)
        .arg("--remote")
        .arg(format!("dir:{}", store.display()))
        .assert()
        .success();

    let remote = store.join("collections/foo");
    assert!(remote.join("last_harvest.json").exists());
    assert!(!remote.join("lock.json").exists());
    assert_eq!(files_named(&remote.join("harvests"), ".jsonl.gz").len(), 1);
    assert_eq!(files_named(&remote.join("changesets"), ".json").len(), 1);
    assert_eq!(
        read_json(&remote.join("collection.json"))["users"]["481186914"]["screen_name"],
        "real_justin_littman"
    );
    // Archives are removed locally once they reach the store.
    assert!(files_named(&root.join("foo/harvests"), ".jsonl.gz").is_empty());
}

#[test]
fn locked_collection_is_refused_then_unlocked() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("collections");
    write_json(&root.join("foo/collection.json"), &timeline_config());
    write_json(
        &root.join("foo/lock.json"),
        &json!({"harvest_id": "2019-03-10T13:57:52.000000"}),
    );
    let items = tmp.path().join("items.jsonl");
    write_items(&items);

    harvester(tmp.path())
        .arg("harvest")
        .arg("foo")
        .arg("--source")
        .arg(&items)
        .arg("--collections-path")
        .arg(&root)
        .assert()
        .failure()
        .stderr(predicates::str::contains("E001_LOCKED"));
    assert!(root.join("foo/lock.json").exists());

    harvester(tmp.path())
        .arg("unlock")
        .arg("foo")
        .arg("--collections-path")
        .arg(&root)
        .assert()
        .success()
        .stdout(predicates::str::contains("removed lock on foo"));
    assert!(!root.join("foo/lock.json").exists());
    assert!(!root.join("foo/last_harvest.json").exists());
}

#[test]
fn config_template_and_validate() {
    let tmp = tempdir().expect("tempdir");

    harvester(tmp.path())
        .args(["config", "template", "user_timeline", "--id", "foo"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"delete_users_for\""));

    let bad = tmp.path().join("bad.json");
    write_json(&bad, &json!({"id": "has space", "type": "search", "search": {}}));
    harvester(tmp.path())
        .args(["config", "validate"])
        .arg(&bad)
        .assert()
        .failure()
        .stderr(predicates::str::contains("Id contains spaces."))
        .stderr(predicates::str::contains("Missing keys."))
        .stderr(predicates::str::contains("Query must be provided."));

    let good = tmp.path().join("good.json");
    write_json(&good, &timeline_config());
    harvester(tmp.path())
        .args(["config", "validate"])
        .arg(&good)
        .assert()
        .success()
        .stdout(predicates::str::contains("is valid"));
}

#[test]
fn config_update_records_history() {
    let tmp = tempdir().expect("tempdir");
    let store = tmp.path().join("store");
    let remote = format!("dir:{}", store.display());
    let file = tmp.path().join("foo.json");
    write_json(&file, &timeline_config());

    harvester(tmp.path())
        .args(["config", "update"])
        .arg(&file)
        .args(["--remote", &remote])
        .assert()
        .success()
        .stdout(predicates::str::contains("creating collection foo"));
    let stored = read_json(&store.join("collections/foo/collection.json"));
    let mut edited = read_json(&file);
    assert!(edited["timestamp"].is_string());
    assert_eq!(edited["timestamp"], stored["timestamp"]);

    edited["users"]["481186914"] = json!({"screen_name": "justin_littman"});
    write_json(&file, &edited);
    harvester(tmp.path())
        .args(["config", "user-ids"])
        .arg(&file)
        .arg("783214")
        .assert()
        .success()
        .stdout(predicates::str::contains("added 1 users"));
    harvester(tmp.path())
        .args(["config", "update"])
        .arg(&file)
        .args(["--remote", &remote])
        .assert()
        .success();

    harvester(tmp.path())
        .args(["config", "changes", "foo", "--remote", &remote])
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "users -> 481186914 -> screen_name changed from (unset) to justin_littman",
        ));

    harvester(tmp.path())
        .args(["config", "update"])
        .arg(&file)
        .args(["--remote", &remote])
        .assert()
        .success()
        .stdout(predicates::str::contains("no changes"));
}

#[test]
fn config_update_refuses_stale_copy_unless_forced() {
    let tmp = tempdir().expect("tempdir");
    let store = tmp.path().join("store");
    let remote = format!("dir:{}", store.display());
    let mut stored = timeline_config();
    stored["users"]["481186914"] = json!({"since_id": "500"});
    stored["timestamp"] = json!("2019-03-11T12:00:00.000000");
    write_json(&store.join("collections/foo/collection.json"), &stored);

    let file = tmp.path().join("foo.json");
    let mut stale = stored.clone();
    stale["users"]["481186914"] = json!({"since_id": "100"});
    stale["timestamp"] = json!("2019-03-01T12:00:00.000000");
    write_json(&file, &stale);

    harvester(tmp.path())
        .args(["config", "update"])
        .arg(&file)
        .args(["--remote", &remote])
        .assert()
        .failure()
        .stderr(predicates::str::contains("E006_STALE_CONFIG"));
    let kept = read_json(&store.join("collections/foo/collection.json"));
    assert_eq!(kept["users"]["481186914"]["since_id"], "500");

    harvester(tmp.path())
        .args(["config", "update", "--force"])
        .arg(&file)
        .args(["--remote", &remote])
        .assert()
        .success();
    let forced = read_json(&store.join("collections/foo/collection.json"));
    assert_eq!(forced["users"]["481186914"]["since_id"], "100");
    assert_eq!(read_json(&file)["timestamp"], forced["timestamp"]);
}
