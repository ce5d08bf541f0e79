//! Rotating gzip JSON-lines archive with a SHA-1 manifest.
//!
//! Items land in `tweets-<YYYYMMDDHHMMSS>.jsonl.gz` inside the session directory.
//! A file is finalized when it reaches the item threshold (checked before each
//! write), when the rollover timer fires, or on close. Finalizing appends
//! `<sha1>  <basename>` to `manifest-sha1.txt` and hands the file to the relay.

use crate::harvest::paths::CollectionPaths;
use crate::harvest::relay::FileQueue;
use crate::harvest::stats::HarvestStats;
use crate::harvest::util::utc_now;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_ITEMS_PER_FILE: u64 = 250_000;
pub const DEFAULT_SECS_PER_FILE: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverPolicy {
    pub items_per_file: u64,
    pub secs_per_file: u64,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self {
            items_per_file: DEFAULT_ITEMS_PER_FILE,
            secs_per_file: DEFAULT_SECS_PER_FILE,
        }
    }
}

impl RolloverPolicy {
    fn max_age(&self) -> Duration {
        Duration::from_secs(self.secs_per_file.max(1))
    }
}

struct ActiveFile {
    path: PathBuf,
    encoder: GzEncoder<BufWriter<File>>,
    items: u64,
    opened_at: Instant,
}

struct WriterState {
    active: Option<ActiveFile>,
    used_names: HashSet<String>,
    /// Failure raised on the timer thread, reported by the next `write` or `close`.
    deferred: Option<anyhow::Error>,
}

struct Shared {
    harvest_dir: PathBuf,
    manifest: PathBuf,
    queue: FileQueue,
    stats: Arc<HarvestStats>,
    policy: RolloverPolicy,
    state: Mutex<WriterState>,
}

pub struct ArchiveWriter {
    shared: Arc<Shared>,
    cancel: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ArchiveWriter {
    /// Creates the first archive file and arms the rollover timer.
    pub fn open(
        paths: &CollectionPaths,
        harvest_timestamp: &NaiveDateTime,
        queue: FileQueue,
        stats: Arc<HarvestStats>,
        policy: RolloverPolicy,
    ) -> Result<Self> {
        let harvest_dir = paths.harvest_dir(harvest_timestamp);
        fs::create_dir_all(&harvest_dir)
            .with_context(|| format!("failed to create {}", harvest_dir.display()))?;
        let shared = Arc::new(Shared {
            manifest: paths.manifest_file(harvest_timestamp),
            harvest_dir,
            queue,
            stats,
            policy,
            state: Mutex::new(WriterState {
                active: None,
                used_names: HashSet::new(),
                deferred: None,
            }),
        });
        {
            let mut state = shared.state.lock();
            let file = shared.new_file(&mut state)?;
            state.active = Some(file);
        }

        let (cancel, cancel_rx) = channel::bounded::<()>(1);
        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name("archive-rollover".to_string())
            .spawn(move || {
                loop {
                    let wait = timer_shared.until_rollover();
                    match cancel_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => timer_shared.rollover_if_due(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("failed to spawn archive rollover timer")?;

        Ok(Self {
            shared,
            cancel: Some(cancel),
            timer: Some(timer),
        })
    }

    pub fn write<T: Serialize>(&self, item: &T) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');

        let mut state = self.shared.state.lock();
        if let Some(err) = state.deferred.take() {
            return Err(err);
        }
        let full = state
            .active
            .as_ref()
            .is_some_and(|file| file.items >= self.shared.policy.items_per_file);
        if full || state.active.is_none() {
            debug!("rolling over after {} items", self.shared.policy.items_per_file);
            self.shared.rotate(&mut state)?;
        }
        let Some(file) = state.active.as_mut() else {
            anyhow::bail!("archive writer has no open file");
        };
        file.encoder
            .write_all(&line)
            .with_context(|| format!("failed to write {}", file.path.display()))?;
        file.items += 1;
        drop(state);

        self.shared.stats.items.incr();
        Ok(())
    }

    /// Cancels the timer and finalizes the current file. An empty file is discarded.
    pub fn close(mut self) -> Result<()> {
        self.stop_timer();
        let mut state = self.shared.state.lock();
        let finalized = match state.active.take() {
            Some(file) => self.shared.finalize(file),
            None => Ok(()),
        };
        if let Some(err) = state.deferred.take() {
            return Err(err);
        }
        finalized
    }

    fn stop_timer(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                warn!("archive rollover timer panicked");
            }
        }
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        self.stop_timer();
        let file = self.shared.state.lock().active.take();
        if let Some(file) = file {
            if let Err(err) = self.shared.finalize(file) {
                warn!("failed to finalize archive on drop: {err:#}");
            }
        }
    }
}

impl Shared {
    fn until_rollover(&self) -> Duration {
        let state = self.state.lock();
        match &state.active {
            Some(file) => self.policy.max_age().saturating_sub(file.opened_at.elapsed()),
            None => self.policy.max_age(),
        }
    }

    fn rollover_if_due(&self) {
        let mut state = self.state.lock();
        let Some(file) = state.active.as_mut() else {
            return;
        };
        if file.opened_at.elapsed() < self.policy.max_age() {
            return;
        }
        if file.items == 0 {
            // Nothing to rotate; restart the window on the same file.
            file.opened_at = Instant::now();
            return;
        }
        debug!("rolling over after {}s", self.policy.secs_per_file);
        if let Err(err) = self.rotate(&mut state) {
            warn!("timed rollover failed: {err:#}");
            state.deferred.get_or_insert(err);
        }
    }

    fn rotate(&self, state: &mut WriterState) -> Result<()> {
        if let Some(file) = state.active.take() {
            self.finalize(file)?;
        }
        let file = self.new_file(state)?;
        state.active = Some(file);
        Ok(())
    }

    fn new_file(&self, state: &mut WriterState) -> Result<ActiveFile> {
        let stamp = utc_now().format("%Y%m%d%H%M%S").to_string();
        let mut name = format!("tweets-{stamp}.jsonl.gz");
        let mut n = 1;
        while state.used_names.contains(&name) {
            name = format!("tweets-{stamp}-{n}.jsonl.gz");
            n += 1;
        }
        state.used_names.insert(name.clone());

        let path = self.harvest_dir.join(&name);
        debug!(path = %path.display(), "starting archive file");
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(ActiveFile {
            path,
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
            items: 0,
            opened_at: Instant::now(),
        })
    }

    fn finalize(&self, file: ActiveFile) -> Result<()> {
        let ActiveFile {
            path,
            encoder,
            items,
            ..
        } = file;
        let inner = encoder
            .finish()
            .with_context(|| format!("failed to finish {}", path.display()))?;
        if items == 0 {
            drop(inner);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove empty {}", path.display()))?;
            return Ok(());
        }
        let handle = inner
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("failed to flush {}", path.display()))?;
        handle
            .sync_all()
            .with_context(|| format!("failed to sync {}", path.display()))?;
        drop(handle);

        let digest = sha1_file(&path)?;
        let size = fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        self.append_manifest(&digest, &path)?;
        self.stats.files.incr();
        self.stats.bytes.increment(size);
        debug!(path = %path.display(), items, size, "archive file closed");
        self.queue.publish(path, true);
        Ok(())
    }

    fn append_manifest(&self, digest: &str, path: &Path) -> Result<()> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut manifest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.manifest)
            .with_context(|| format!("failed to open {}", self.manifest.display()))?;
        writeln!(manifest, "{digest}  {basename}")
            .and_then(|()| manifest.sync_all())
            .with_context(|| format!("failed to append {}", self.manifest.display()))?;
        self.queue.publish(self.manifest.clone(), false);
        Ok(())
    }
}

fn sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha1::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}
