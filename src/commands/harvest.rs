use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::commands::{CommandReport, collections_root, open_remote};
use crate::harvest::replay::ReplaySource;
use crate::harvest::session::{HarvestSession, SessionOptions};
use crate::harvest::settings::load_settings;
use crate::harvest::util::{human_size, iso_timestamp};

#[derive(Debug, Clone, Default)]
pub struct HarvestArgs {
    pub collection_id: String,
    pub source: PathBuf,
    pub collections_path: Option<PathBuf>,
    pub remote: Option<String>,
    pub items_per_file: Option<u64>,
    pub secs_per_file: Option<u64>,
    pub port: Option<u16>,
    pub monitor: bool,
    pub wait: bool,
}

pub fn run(args: &HarvestArgs) -> Result<CommandReport> {
    let mut report = CommandReport::new("harvest");
    let mut settings = load_settings()?;
    if let Some(items) = args.items_per_file {
        settings.archive.items_per_file = items.max(1);
    }
    if let Some(secs) = args.secs_per_file {
        settings.archive.secs_per_file = secs.max(1);
    }
    if let Some(port) = args.port {
        settings.control.enabled = true;
        settings.control.port = port;
    }
    if args.monitor {
        settings.monitor.enabled = true;
    }

    let control = settings.control_options();
    if args.wait && control.is_none() {
        report.issue(
            "--wait needs the control server; pass --port or set HARVESTER_CONTROL_ENABLED",
        );
        return Ok(report);
    }

    let root = collections_root(args.collections_path.as_deref(), &settings);
    let remote = open_remote(args.remote.as_deref(), &settings)?;
    report.detail(format!("collection={}", args.collection_id));
    report.detail(format!("collections_path={}", root.display()));
    report.detail(format!(
        "remote={}",
        remote
            .as_ref()
            .map(|r| r.describe())
            .unwrap_or_else(|| "none (local only)".to_string())
    ));

    let source = ReplaySource::open(&args.source)?;
    report.detail(format!("source={} ({} items)", args.source.display(), source.len()));

    let session = HarvestSession::new(SessionOptions {
        remote,
        policy: settings.rollover(),
        control,
        monitor_interval: settings
            .monitor
            .enabled
            .then(|| Duration::from_secs(settings.monitor.interval_secs)),
        shutdown_when_done: !args.wait,
        handle_signals: true,
        ..SessionOptions::local(args.collection_id.as_str(), root)
    });

    match session.harvest(Box::new(source)) {
        Ok(outcome) => {
            report.detail(format!(
                "harvest={}",
                iso_timestamp(&outcome.harvest_timestamp)
            ));
            report.detail(format!("harvest_dir={}", outcome.harvest_dir.display()));
            report.detail(format!(
                "items={} files={} bytes={}",
                outcome.stats.items,
                outcome.stats.files,
                human_size(outcome.stats.file_bytes)
            ));
            match outcome.changeset_file {
                Some(path) => report.detail(format!("changeset={}", path.display())),
                None => report.detail("no configuration changes"),
            }
        }
        Err(err) => report.absorb(err)?,
    }
    Ok(report)
}
