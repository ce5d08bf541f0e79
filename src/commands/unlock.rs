use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, collections_root, open_remote};
use crate::harvest::lock::{ReleaseOutcome, force_unlock};
use crate::harvest::settings::load_settings;

pub fn run(
    collection_id: &str,
    collections_path: Option<PathBuf>,
    remote: Option<&str>,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("unlock");
    let settings = load_settings()?;
    let root = collections_root(collections_path.as_deref(), &settings);
    let remote = open_remote(remote, &settings)?;

    match force_unlock(&root, collection_id, remote) {
        Ok(ReleaseOutcome::Forced) => report.detail(format!("removed lock on {collection_id}")),
        Ok(ReleaseOutcome::NotLocked) => {
            report.detail(format!("{collection_id} was not locked"));
        }
        Ok(ReleaseOutcome::Released) => {
            report.detail(format!("released lock on {collection_id}"));
        }
        Err(err) => report.absorb(err)?,
    }
    Ok(report)
}
