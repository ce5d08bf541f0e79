use crate::error::HarvestError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::fs;
use std::path::Path;

/// Credential fields every collection must carry.
pub const KEY_FIELDS: [&str; 4] = [
    "consumer_key",
    "consumer_secret",
    "access_token",
    "access_token_secret",
];

/// Long-lived secrets that never leave the collection root.
pub const SECRET_KEY_FIELDS: [&str; 2] = ["consumer_secret", "access_token_secret"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    UserTimeline,
    Filter,
    Search,
}

impl CollectionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user_timeline" => Some(Self::UserTimeline),
            "filter" => Some(Self::Filter),
            "search" => Some(Self::Search),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserTimeline => "user_timeline",
            Self::Filter => "filter",
            Self::Search => "search",
        }
    }

    /// Top-level section that holds this type's harvest criteria.
    pub fn section(self) -> &'static str {
        match self {
            Self::UserTimeline => "users",
            Self::Filter => "filter",
            Self::Search => "search",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a collection harvests and how, as stored in `collection.json`.
///
/// The document is open-ended, so it is kept as a JSON object; typed accessors
/// cover the fields the harvester relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionConfig {
    doc: Map<String, Value>,
}

impl CollectionConfig {
    pub fn from_map(doc: Map<String, Value>) -> Self {
        Self { doc }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(doc) => Ok(Self { doc }),
            other => anyhow::bail!("collection configuration must be a JSON object, got {other}"),
        }
    }

    /// A bare configuration carrying only identity, used as the diff base for new collections.
    pub fn empty(collection_id: &str, collection_type: CollectionType) -> Self {
        let mut doc = Map::new();
        doc.insert("id".to_string(), Value::from(collection_id));
        doc.insert("type".to_string(), Value::from(collection_type.as_str()));
        Self { doc }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_value(value).with_context(|| format!("invalid document in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(&self.doc)?;
        fs::write(path, format!("{data}\n"))
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.doc
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.doc
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.doc.get("id").and_then(Value::as_str)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.doc.get("type").and_then(Value::as_str)
    }

    pub fn collection_type(&self) -> Option<CollectionType> {
        self.type_name().and_then(CollectionType::parse)
    }

    pub fn keys(&self) -> Option<&Map<String, Value>> {
        self.doc.get("keys").and_then(Value::as_object)
    }

    pub fn users(&self) -> Option<&Map<String, Value>> {
        self.doc.get("users").and_then(Value::as_object)
    }

    pub fn filter(&self) -> Option<&Map<String, Value>> {
        self.doc.get("filter").and_then(Value::as_object)
    }

    pub fn search(&self) -> Option<&Map<String, Value>> {
        self.doc.get("search").and_then(Value::as_object)
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.doc.get("timestamp").and_then(Value::as_str)
    }

    pub fn set_timestamp(&mut self, timestamp: &str) {
        self.doc
            .insert("timestamp".to_string(), Value::from(timestamp));
    }

    /// Lookup outcomes (`protected`, `suspended`, `not_found`) that drop a user.
    pub fn delete_users_for(&self) -> Vec<String> {
        self.doc
            .get("delete_users_for")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adds user ids that are not yet part of a user timeline collection.
    pub fn add_user_ids<I, S>(&mut self, user_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let users = self
            .doc
            .entry("users".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !users.is_object() {
            *users = Value::Object(Map::new());
        }
        let Some(users) = users.as_object_mut() else {
            return 0;
        };
        let mut added = 0usize;
        for user_id in user_ids {
            let user_id = user_id.as_ref().trim();
            if user_id.is_empty() || users.contains_key(user_id) {
                continue;
            }
            users.insert(user_id.to_string(), Value::Object(Map::new()));
            added += 1;
        }
        added
    }

    /// Returns every rule this configuration breaks; empty means valid.
    pub fn invalid_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        self.check_id(&mut reasons);
        self.check_keys(&mut reasons);
        self.check_type(&mut reasons);
        match self.collection_type() {
            Some(CollectionType::UserTimeline) => self.check_timeline(&mut reasons),
            Some(CollectionType::Filter) => self.check_filter(&mut reasons),
            Some(CollectionType::Search) => self.check_search(&mut reasons),
            None => {}
        }
        reasons
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let reasons = self.invalid_reasons();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::ConfigurationInvalid(reasons))
        }
    }

    fn check_id(&self, reasons: &mut Vec<String>) {
        match self.doc.get("id") {
            None => reasons.push("Missing id.".to_string()),
            Some(Value::String(id)) if id.chars().any(char::is_whitespace) => {
                reasons.push("Id contains spaces.".to_string())
            }
            Some(Value::String(_)) => {}
            Some(_) => reasons.push("Id is not a string.".to_string()),
        }
    }

    fn check_keys(&self, reasons: &mut Vec<String>) {
        let Some(keys) = self.doc.get("keys") else {
            reasons.push("Missing keys.".to_string());
            return;
        };
        let Some(keys) = keys.as_object() else {
            reasons.push("Keys are not properly structured.".to_string());
            return;
        };
        for field in KEY_FIELDS {
            if !keys.contains_key(field) {
                reasons.push(format!("Missing {field}."));
            }
        }
    }

    fn check_type(&self, reasons: &mut Vec<String>) {
        match self.doc.get("type") {
            None => reasons.push("Missing type.".to_string()),
            Some(_) if self.collection_type().is_none() => {
                reasons.push("Unrecognized collection type.".to_string())
            }
            Some(_) => {}
        }
    }

    fn check_timeline(&self, reasons: &mut Vec<String>) {
        let Some(users) = self.doc.get("users") else {
            reasons.push("A user_timeline collection, but missing users.".to_string());
            return;
        };
        let Some(users) = users.as_object() else {
            reasons.push("Users is not properly structured.".to_string());
            return;
        };
        for (user_id, user) in users {
            if user_id.is_empty() || !user_id.chars().all(|c| c.is_ascii_digit()) {
                reasons.push(format!("{user_id} is not a user_id."));
            }
            if !user.is_object() {
                reasons.push(format!("User {user_id} is not properly structured."));
            }
        }
    }

    fn check_filter(&self, reasons: &mut Vec<String>) {
        let Some(filter) = self.doc.get("filter") else {
            reasons.push("A filter collection, but missing filter.".to_string());
            return;
        };
        let Some(filter) = filter.as_object() else {
            reasons.push("Filter is not properly structured.".to_string());
            return;
        };
        if !["track", "follow", "locations"]
            .iter()
            .any(|field| filter.contains_key(*field))
        {
            reasons.push("Must provide track, follow, or locations for a filter.".to_string());
        }
    }

    fn check_search(&self, reasons: &mut Vec<String>) {
        let Some(search) = self.doc.get("search") else {
            reasons.push("A search collection, but missing search.".to_string());
            return;
        };
        let Some(search) = search.as_object() else {
            reasons.push("Search is not properly structured.".to_string());
            return;
        };
        if !search.contains_key("query") {
            reasons.push("Query must be provided.".to_string());
        }
    }

    /// Copy safe to store next to harvested data: secret credentials removed.
    pub fn scrubbed(&self) -> Self {
        let mut clean = self.clone();
        if let Some(keys) = clean.doc.get_mut("keys").and_then(Value::as_object_mut) {
            for field in SECRET_KEY_FIELDS {
                keys.remove(field);
            }
        }
        clean
    }
}

const ID_PLACEHOLDER: &str =
    "<Identifier for collection. Should not have spaces. Must be unique for bucket.>";

/// Starter document for `config template`, with placeholders to fill in.
pub fn config_template(collection_type: CollectionType, collection_id: Option<&str>) -> Value {
    let mut template = json!({
        "id": collection_id.unwrap_or(ID_PLACEHOLDER),
        "keys": {
            "consumer_key": "<Your API consumer key>",
            "consumer_secret": "<Your API consumer secret>",
            "access_token": "<Your API access token>",
            "access_token_secret": "<Your API access token secret>"
        },
        "type": collection_type.as_str(),
    });
    let section = match collection_type {
        CollectionType::UserTimeline => {
            template["delete_users_for"] = json!(["protected", "suspended", "not_found"]);
            json!({})
        }
        CollectionType::Filter => json!({
            "track": "<Comma separated list of terms or hashtags>",
            "follow": "<Comma separated list of user ids>",
            "max_records": "<Optional. Maximum number of records to collect per harvest.>"
        }),
        CollectionType::Search => json!({
            "query": "<Query>",
            "max_records": "<Optional. Maximum number of records to collect per harvest.>"
        }),
    };
    template[collection_type.section()] = section;
    template
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::CollectionConfig;
    use serde_json::json;

    fn keys() -> serde_json::Value {
        json!({
            "consumer_key": "mBbq9ruEckInQHUir8Kn0",
            "consumer_secret": "Pf28yReBUD90pLVOsb4r5ZnKCQ6xlOomBAjD5npFEQ6Rm",
            "access_token": "481186914-5yIyfryJqcHV29YVL37BOzjseYuRzCLmwO6",
            "access_token_secret": "S51yY5Hjffts4WMKMgvGendxbZVsZO014Z38Tfvc"
        })
    }

    pub fn timeline_config() -> CollectionConfig {
        CollectionConfig::from_value(json!({
            "id": "foo",
            "type": "user_timeline",
            "keys": keys(),
            "users": {
                "481186914": {"screen_name": "justin_littman"},
                "6253282": {"screen_name": "twitterapi"},
                "12": {"screen_name": "jack", "since_id": "12345"}
            }
        }))
        .expect("timeline fixture")
    }

    pub fn filter_config() -> CollectionConfig {
        CollectionConfig::from_value(json!({
            "id": "foo",
            "type": "filter",
            "keys": keys(),
            "filter": {"track": "foo,#bar"}
        }))
        .expect("filter fixture")
    }

    pub fn search_config() -> CollectionConfig {
        CollectionConfig::from_value(json!({
            "id": "foo",
            "type": "search",
            "keys": keys(),
            "search": {"query": "foo"}
        }))
        .expect("search fixture")
    }
}
