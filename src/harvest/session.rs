//! One harvest session for one collection.
//!
//! A session syncs the collection from the remote store, refuses to start when
//! the collection is locked, takes the lock, runs the collection task against a
//! fresh archive, and folds the changes it discovered back into the latest
//! configuration. The lock is released and the relay drained on every exit path
//! once the lock is held; the first failure is returned only after both.

use crate::collection::changeset::Changeset;
use crate::collection::config::CollectionConfig;
use crate::error::HarvestError;
use crate::harvest::archive::RolloverPolicy;
use crate::harvest::collect::{CollectTask, ItemSource};
use crate::harvest::lock::{CollectionLock, reject_if_locked};
use crate::harvest::monitor::Monitor;
use crate::harvest::paths::CollectionPaths;
use crate::harvest::relay::{FileQueue, FileRelay, write_json_file};
use crate::harvest::server::{ControlOptions, ControlServer};
use crate::harvest::signals::{SessionSignals, SignalWatcher};
use crate::harvest::stats::{HarvestStats, StatsSnapshot};
use crate::harvest::util::{iso_timestamp, utc_now};
use crate::remote::Remote;
use crate::remote::sync::{sync_collection_config, sync_collection_config_file};
use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CHANGESET_NOTE: &str = "Changes based on harvester.";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub collection_id: String,
    pub collections_root: PathBuf,
    pub remote: Option<Remote>,
    pub policy: RolloverPolicy,
    pub control: Option<ControlOptions>,
    pub monitor_interval: Option<Duration>,
    /// Skip waiting for a shutdown request once the session has stopped.
    pub shutdown_when_done: bool,
    /// Turn SIGINT and SIGTERM into stop and shutdown for the whole session.
    pub handle_signals: bool,
}

impl SessionOptions {
    pub fn local(collection_id: impl Into<String>, collections_root: impl Into<PathBuf>) -> Self {
        Self {
            collection_id: collection_id.into(),
            collections_root: collections_root.into(),
            remote: None,
            policy: RolloverPolicy::default(),
            control: None,
            monitor_interval: None,
            shutdown_when_done: true,
            handle_signals: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub harvest_timestamp: NaiveDateTime,
    pub stats: StatsSnapshot,
    pub changeset_file: Option<PathBuf>,
    pub harvest_dir: PathBuf,
}

pub struct HarvestSession {
    options: SessionOptions,
    paths: CollectionPaths,
    signals: SessionSignals,
}

impl HarvestSession {
    pub fn new(options: SessionOptions) -> Self {
        let paths = CollectionPaths::new(&options.collections_root, &options.collection_id);
        Self {
            options,
            paths,
            signals: SessionSignals::new(),
        }
    }

    /// Handles for stopping the session from another thread.
    #[cfg(test)]
    pub fn signals(&self) -> SessionSignals {
        self.signals.clone()
    }

    pub fn harvest(&self, source: Box<dyn ItemSource>) -> Result<SessionReport> {
        let id = self.options.collection_id.as_str();
        let root = self.options.collections_root.as_path();

        if let Some(remote) = &self.options.remote {
            info!(collection_id = id, remote = %remote.describe(), "syncing collection");
            sync_collection_config(root, id, remote)?;
        }
        reject_if_locked(&self.paths)?;
        let config = self.load_config()?;

        let harvest_timestamp = utc_now();
        let stats = Arc::new(HarvestStats::new(id, harvest_timestamp));
        let watcher = if self.options.handle_signals {
            Some(SignalWatcher::start(self.signals.clone())?)
        } else {
            None
        };
        let server = match &self.options.control {
            Some(control) => Some(ControlServer::start(
                control,
                Arc::clone(&stats),
                self.signals.clone(),
            )?),
            None => None,
        };
        let monitor = match self.options.monitor_interval {
            Some(interval) => Some(Monitor::start(interval, root)?),
            None => None,
        };
        let (queue, relay) = FileRelay::spawn(root, self.options.remote.clone())?;

        let lock = CollectionLock::new(self.paths.clone(), queue.clone());
        if let Err(err) = lock.acquire(&harvest_timestamp) {
            if let Err(relay_err) = relay.finish() {
                warn!("file relay failed after lock rejection: {relay_err:#}");
            }
            return Err(err);
        }
        info!(
            collection_id = id,
            harvest = %iso_timestamp(&harvest_timestamp),
            "harvest started"
        );

        let outcome = self.run_locked(config, harvest_timestamp, &queue, &stats, source);
        let released = lock.release(false).map(drop);
        let relayed = relay.finish();
        let result = first_failure(outcome, released, relayed);

        self.signals.stopped.set();
        let changeset_file = match result {
            Ok(changeset_file) => changeset_file,
            Err(err) => {
                error!(collection_id = id, "harvest failed: {err:#}");
                shut_down(watcher, server, monitor);
                return Err(err);
            }
        };

        let report = SessionReport {
            harvest_timestamp,
            stats: stats.snapshot(),
            changeset_file,
            harvest_dir: self.paths.harvest_dir(&harvest_timestamp),
        };
        info!(
            collection_id = id,
            items = report.stats.items,
            files = report.stats.files,
            "harvest stopped"
        );

        if self.options.shutdown_when_done {
            self.signals.shutdown.set();
        } else {
            info!("waiting for shutdown request");
        }
        self.signals.shutdown.wait();
        shut_down(watcher, server, monitor);
        Ok(report)
    }

    fn load_config(&self) -> Result<CollectionConfig> {
        let config_file = self.paths.config_file();
        if !config_file.is_file() {
            return Err(HarvestError::MissingCollection(self.options.collection_id.clone()).into());
        }
        let config = CollectionConfig::load(&config_file)?;
        config.validate()?;
        Ok(config)
    }

    fn run_locked(
        &self,
        config: CollectionConfig,
        harvest_timestamp: NaiveDateTime,
        queue: &FileQueue,
        stats: &Arc<HarvestStats>,
        source: Box<dyn ItemSource>,
    ) -> Result<Option<PathBuf>> {
        write_json_file(
            queue,
            &self.paths.harvest_config_file(&harvest_timestamp),
            &config.scrubbed().to_value(),
        )?;

        let mut changeset = Changeset::at(&utc_now());
        changeset.harvest_timestamp = Some(iso_timestamp(&harvest_timestamp));
        changeset.note = Some(CHANGESET_NOTE.to_string());
        let starting_timestamp = config.timestamp().map(str::to_string);

        let task = CollectTask {
            config,
            paths: self.paths.clone(),
            harvest_timestamp,
            queue: queue.clone(),
            stats: Arc::clone(stats),
            policy: self.options.policy,
            stop: self.signals.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("collect".to_string())
            .spawn(move || {
                let mut source = source;
                task.run(source.as_mut(), changeset)
            })
            .context("failed to spawn collection task")?;
        let collected = handle
            .join()
            .map_err(|_| anyhow!("collection task panicked"))
            .and_then(|result| result);

        let recorded = write_json_file(
            queue,
            &self.paths.stats_file(&harvest_timestamp),
            &stats.snapshot(),
        );
        let changeset = match (collected, recorded) {
            (Ok(changeset), Ok(())) => changeset,
            (Err(err), recorded) => {
                if let Err(stats_err) = recorded {
                    warn!("failed to record stats: {stats_err:#}");
                }
                return Err(err);
            }
            (Ok(_), Err(err)) => return Err(err),
        };

        self.apply_changes(changeset, starting_timestamp.as_deref(), queue)
    }

    /// Merges discovered changes into the latest configuration and persists both.
    fn apply_changes(
        &self,
        mut changeset: Changeset,
        starting_timestamp: Option<&str>,
        queue: &FileQueue,
    ) -> Result<Option<PathBuf>> {
        if !changeset.has_changes() {
            debug!("no configuration changes");
            return Ok(None);
        }

        if let Some(remote) = &self.options.remote {
            sync_collection_config_file(
                &self.options.collections_root,
                &self.options.collection_id,
                remote,
            )?;
        }
        let config_file = self.paths.config_file();
        let mut latest = CollectionConfig::load(&config_file)?;
        if latest.timestamp().is_none() || latest.timestamp() != starting_timestamp {
            changeset.clean(&latest);
        }
        if !changeset.has_changes() {
            info!("discovered changes no longer apply to the latest configuration");
            return Ok(None);
        }

        latest.merge_changeset(&changeset);
        write_json_file(queue, &config_file, &latest.to_value())?;
        let changeset_file = self.paths.changeset_file(&changeset.change_time()?);
        write_json_file(queue, &changeset_file, &changeset)?;
        info!(path = %changeset_file.display(), "configuration updated");
        Ok(Some(changeset_file))
    }
}

/// Keeps the earliest failure; later ones are logged.
fn first_failure<T>(outcome: Result<T>, released: Result<()>, relayed: Result<()>) -> Result<T> {
    let mut secondary = Vec::new();
    let result = match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            secondary.push(release_err);
            Err(err)
        }
    };
    let result = match (result, relayed) {
        (result, Ok(())) => result,
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Err(relay_err)) => {
            secondary.push(relay_err);
            Err(err)
        }
    };
    for err in secondary {
        warn!("additional failure while finishing session: {err:#}");
    }
    result
}

fn shut_down(
    watcher: Option<SignalWatcher>,
    server: Option<ControlServer>,
    monitor: Option<Monitor>,
) {
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    if let Some(server) = server {
        server.shutdown();
    }
    if let Some(monitor) = monitor {
        monitor.stop();
    }
}
