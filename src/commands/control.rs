use anyhow::Result;
use std::time::Duration;

use crate::commands::CommandReport;
use crate::harvest::control_client::ControlClient;
use crate::harvest::settings::load_settings;
use crate::harvest::util::human_size;

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn client(host: &str, secret_key: Option<&str>) -> Result<ControlClient> {
    let configured = load_settings()?.control.secret_key;
    let secret = secret_key
        .map(str::to_string)
        .or_else(|| (!configured.trim().is_empty()).then_some(configured));
    ControlClient::new(host, secret.as_deref())
}

pub fn status(host: &str, secret_key: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let snapshot = client(host, secret_key)?.fetch_status()?;
    report.detail(format!("collection={}", snapshot.collection_id));
    report.detail(format!("harvest={}", snapshot.harvest_timestamp));
    report.detail(format!(
        "items={} files={} bytes={}",
        snapshot.items,
        snapshot.files,
        human_size(snapshot.file_bytes)
    ));
    match snapshot.harvest_end_timestamp {
        Some(end) => report.detail(format!("ended={end}")),
        None => report.detail("running"),
    }
    Ok(report)
}

pub fn stop(host: &str, secret_key: Option<&str>, timeout_secs: u64) -> Result<CommandReport> {
    let mut report = CommandReport::new("stop");
    let client = client(host, secret_key)?;
    client.send_stop()?;
    report.detail(format!("stop requested from {host}"));
    if timeout_secs == 0 {
        return Ok(report);
    }
    if client.wait_for_stopped(STOP_POLL_INTERVAL, Duration::from_secs(timeout_secs))? {
        report.detail("harvester stopped");
    } else {
        report.issue(format!(
            "timed out waiting for harvester to stop after {timeout_secs}s"
        ));
    }
    Ok(report)
}

pub fn shutdown(host: &str, secret_key: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("shutdown");
    client(host, secret_key)?.send_shutdown()?;
    report.detail(format!("shutdown requested from {host}"));
    Ok(report)
}
