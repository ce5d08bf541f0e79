use crate::harvest::archive::{DEFAULT_ITEMS_PER_FILE, DEFAULT_SECS_PER_FILE, RolloverPolicy};
use crate::harvest::monitor::DEFAULT_MONITOR_INTERVAL_SECS;
use crate::harvest::paths::DEFAULT_COLLECTIONS_PATH;
use crate::harvest::server::ControlOptions;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    pub items_per_file: u64,
    pub secs_per_file: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            items_per_file: DEFAULT_ITEMS_PER_FILE,
            secs_per_file: DEFAULT_SECS_PER_FILE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Empty leaves the control endpoints open.
    #[serde(default)]
    pub secret_key: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_string(),
            port: 80,
            secret_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub collections_path: String,
    /// Remote store spec; empty means local-only.
    #[serde(default)]
    pub remote: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            collections_path: DEFAULT_COLLECTIONS_PATH.to_string(),
            remote: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarvesterSettings {
    pub archive: ArchiveSettings,
    pub control: ControlSettings,
    pub storage: StorageSettings,
    pub monitor: MonitorSettings,
}

impl HarvesterSettings {
    pub fn rollover(&self) -> RolloverPolicy {
        RolloverPolicy {
            items_per_file: self.archive.items_per_file,
            secs_per_file: self.archive.secs_per_file,
        }
    }

    /// Control server options, or `None` when the server is disabled.
    pub fn control_options(&self) -> Option<ControlOptions> {
        if !self.control.enabled {
            return None;
        }
        Some(ControlOptions {
            bind: self.control.bind.clone(),
            port: self.control.port,
            secret_key: non_empty(&self.control.secret_key),
        })
    }

    pub fn remote_spec(&self) -> Option<String> {
        non_empty(&self.storage.remote)
    }

    pub fn collections_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.collections_path)
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHarvesterSettings {
    archive: Option<ArchiveSettings>,
    control: Option<ControlSettings>,
    storage: Option<StorageSettings>,
    monitor: Option<MonitorSettings>,
}

/// Environment lookup, swappable so overrides can be exercised without touching
/// the process environment.
type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_or_u64(env: EnvLookup<'_>, var: &str, fallback: u64) -> u64 {
    match env(var) {
        Some(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        None => fallback,
    }
}

fn env_or_u16(env: EnvLookup<'_>, var: &str, fallback: u16) -> u16 {
    match env(var) {
        Some(v) => v.trim().parse::<u16>().ok().unwrap_or(fallback),
        None => fallback,
    }
}

fn env_or_bool(env: EnvLookup<'_>, var: &str, fallback: bool) -> bool {
    match env(var) {
        Some(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        None => fallback,
    }
}

fn env_or_string(env: EnvLookup<'_>, var: &str, fallback: &str) -> String {
    match env(var) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn validate(cfg: &HarvesterSettings) -> Result<()> {
    if cfg.archive.items_per_file == 0 {
        return Err(anyhow!("invalid items per file: must be >= 1"));
    }
    if cfg.archive.secs_per_file == 0 {
        return Err(anyhow!("invalid secs per file: must be >= 1 second"));
    }
    if cfg.control.bind.trim().is_empty() {
        return Err(anyhow!("invalid control bind address: cannot be empty"));
    }
    if cfg.storage.collections_path.trim().is_empty() {
        return Err(anyhow!("invalid collections path: cannot be empty"));
    }
    if cfg.monitor.interval_secs == 0 {
        return Err(anyhow!("invalid monitor interval: must be >= 1 second"));
    }
    Ok(())
}

fn resolve_config_path(env: EnvLookup<'_>) -> Option<PathBuf> {
    if let Some(custom) = env("HARVESTER_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(
        home.join(".config")
            .join("social-harvester")
            .join("harvester.toml"),
    )
}

fn merge_file_settings(base: &mut HarvesterSettings, env: EnvLookup<'_>) -> Result<()> {
    let Some(path) = resolve_config_path(env) else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialHarvesterSettings = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse harvester config {}: {err}", path.display()))?;
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(control) = parsed.control {
        base.control = control;
    }
    if let Some(storage) = parsed.storage {
        base.storage = storage;
    }
    if let Some(monitor) = parsed.monitor {
        base.monitor = monitor;
    }
    Ok(())
}

fn load_settings_with(env: EnvLookup<'_>) -> Result<HarvesterSettings> {
    let mut cfg = HarvesterSettings::default();
    merge_file_settings(&mut cfg, env)?;

    cfg.archive.items_per_file =
        env_or_u64(env, "HARVESTER_ITEMS_PER_FILE", cfg.archive.items_per_file);
    cfg.archive.secs_per_file =
        env_or_u64(env, "HARVESTER_SECS_PER_FILE", cfg.archive.secs_per_file);
    cfg.control.enabled = env_or_bool(env, "HARVESTER_CONTROL_ENABLED", cfg.control.enabled);
    cfg.control.bind = env_or_string(env, "HARVESTER_BIND", &cfg.control.bind);
    cfg.control.port = env_or_u16(env, "HARVESTER_PORT", cfg.control.port);
    cfg.control.secret_key = env_or_string(env, "HARVESTER_SECRET_KEY", &cfg.control.secret_key);
    cfg.storage.collections_path = env_or_string(
        env,
        "HARVESTER_COLLECTIONS_PATH",
        &cfg.storage.collections_path,
    );
    cfg.storage.remote = env_or_string(env, "HARVESTER_REMOTE", &cfg.storage.remote);
    cfg.monitor.enabled = env_or_bool(env, "HARVESTER_MONITOR_ENABLED", cfg.monitor.enabled);
    cfg.monitor.interval_secs = env_or_u64(
        env,
        "HARVESTER_MONITOR_INTERVAL_SECS",
        cfg.monitor.interval_secs,
    );

    validate(&cfg)?;
    Ok(cfg)
}

pub fn load_settings() -> Result<HarvesterSettings> {
    load_settings_with(&|var: &str| env::var(var).ok())
}
