pub mod config;
pub mod control;
pub mod harvest;
pub mod last;
pub mod unlock;

use crate::error::find_harvest_error;
use crate::harvest::settings::HarvesterSettings;
use crate::remote::Remote;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    /// Records a typed harvest failure as a coded issue; anything else is returned.
    pub fn absorb(&mut self, err: anyhow::Error) -> Result<()> {
        match find_harvest_error(&err) {
            Some(harvest_err) => {
                let code = harvest_err
                    .code()
                    .map(|code| format!("[{}] ", code.as_str()))
                    .unwrap_or_default();
                self.issue(format!("{code}{err:#}"));
                Ok(())
            }
            None => Err(err),
        }
    }
}

pub fn collections_root(cli_value: Option<&Path>, settings: &HarvesterSettings) -> PathBuf {
    cli_value
        .map(Path::to_path_buf)
        .unwrap_or_else(|| settings.collections_root())
}

/// Opens the store named on the command line, falling back to settings.
pub fn open_remote(
    cli_value: Option<&str>,
    settings: &HarvesterSettings,
) -> Result<Option<Remote>> {
    match cli_value.map(str::to_string).or_else(|| settings.remote_spec()) {
        Some(spec) => Remote::open(&spec).map(Some),
        None => Ok(None),
    }
}

/// Like [`open_remote`] for commands that cannot run local-only.
pub fn require_remote(cli_value: Option<&str>, settings: &HarvesterSettings) -> Result<Remote> {
    match open_remote(cli_value, settings)? {
        Some(remote) => Ok(remote),
        None => anyhow::bail!("a remote store is required; pass --remote or set HARVESTER_REMOTE"),
    }
}
