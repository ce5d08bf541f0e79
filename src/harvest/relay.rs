//! Asynchronous mirror of local artifacts to the remote store.
//!
//! Producers push [`FileOp`]s onto a [`FileQueue`]; a single [`FileRelay`] thread
//! drains them in FIFO order. A failure stops the drain and is held until
//! [`FileRelay::finish`], which is the only place it surfaces.

use crate::error::HarvestError;
use crate::harvest::paths::remote_key;
use crate::remote::Remote;
use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Publish { path: PathBuf, delete_local: bool },
    Remove { path: PathBuf },
}

impl FileOp {
    fn label(&self) -> String {
        match self {
            Self::Publish { path, .. } => format!("publish {}", path.display()),
            Self::Remove { path } => format!("remove {}", path.display()),
        }
    }
}

/// Producer handle. Cheap to clone; every clone feeds the same relay.
#[derive(Debug, Clone)]
pub struct FileQueue {
    tx: Sender<FileOp>,
}

impl FileQueue {
    pub fn unbounded() -> (Self, Receiver<FileOp>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn publish(&self, path: impl Into<PathBuf>, delete_local: bool) {
        self.push(FileOp::Publish {
            path: path.into(),
            delete_local,
        });
    }

    pub fn remove(&self, path: impl Into<PathBuf>) {
        self.push(FileOp::Remove { path: path.into() });
    }

    pub fn push(&self, op: FileOp) {
        if let Err(err) = self.tx.send(op) {
            warn!(op = %err.0.label(), "file relay is no longer running; operation dropped");
        }
    }
}

pub struct FileRelay {
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl FileRelay {
    /// Starts the consumer thread. Without a remote store every operation is a no-op.
    pub fn start(
        rx: Receiver<FileOp>,
        local_root: impl Into<PathBuf>,
        remote: Option<Remote>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));
        let worker = RelayWorker {
            rx,
            local_root: local_root.into(),
            remote,
            stop: Arc::clone(&stop),
            processed: Arc::clone(&processed),
        };
        let handle = thread::Builder::new()
            .name("file-relay".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn file relay thread")?;
        Ok(Self {
            stop,
            processed,
            handle: Some(handle),
        })
    }

    /// Queue and relay in one step.
    pub fn spawn(
        local_root: impl Into<PathBuf>,
        remote: Option<Remote>,
    ) -> Result<(FileQueue, Self)> {
        let (queue, rx) = FileQueue::unbounded();
        let relay = Self::start(rx, local_root, remote)?;
        Ok((queue, relay))
    }

    #[cfg(test)]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Requests stop, waits until the queue is drained, and returns the first failure.
    pub fn finish(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => {
                    debug!(
                        relayed = self.processed.load(Ordering::SeqCst),
                        "file relay drained"
                    );
                    result
                }
                Err(_) => Err(anyhow::anyhow!("file relay thread panicked"))
                    .context(HarvestError::RelayFailure("relay thread".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl Drop for FileRelay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if let Ok(Err(err)) = handle.join() {
                warn!("file relay failed: {err:#}");
            }
        }
    }
}

struct RelayWorker {
    rx: Receiver<FileOp>,
    local_root: PathBuf,
    remote: Option<Remote>,
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl RelayWorker {
    fn run(self) -> Result<()> {
        debug!("file relay started");
        loop {
            let op = if self.stop.load(Ordering::SeqCst) {
                match self.rx.try_recv() {
                    Ok(op) => op,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.rx.recv_timeout(POLL_INTERVAL) {
                    Ok(op) => op,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        // Every producer is gone; nothing more can arrive.
                        if self.stop.load(Ordering::SeqCst) {
                            break;
                        }
                        thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                }
            };
            self.process(&op)
                .context(HarvestError::RelayFailure(op.label()))?;
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
        debug!("file relay finished");
        Ok(())
    }

    fn process(&self, op: &FileOp) -> Result<()> {
        let Some(remote) = &self.remote else {
            debug!(op = %op.label(), "no remote store; leaving file in place");
            return Ok(());
        };
        match op {
            FileOp::Publish { path, delete_local } => {
                let key = remote_key(&self.local_root, path);
                debug!(path = %path.display(), key = %key, "publishing");
                remote.upload_file(path, &key)?;
                if *delete_local {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
            FileOp::Remove { path } => {
                let key = remote_key(&self.local_root, path);
                debug!(key = %key, "removing remote object");
                remote.delete(&key)?;
            }
        }
        Ok(())
    }
}

/// Local file whose publish is enqueued once it has been written and synced.
pub struct QueuedFile {
    path: PathBuf,
    writer: BufWriter<File>,
    queue: FileQueue,
    delete_local: bool,
}

impl QueuedFile {
    pub fn create(
        path: impl Into<PathBuf>,
        queue: &FileQueue,
        delete_local: bool,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            queue: queue.clone(),
            delete_local,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn write_json_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        self.write_line(&line)
    }

    pub fn write_json_pretty<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(value)?;
        self.write_line(&body)
    }

    /// Flushes, fsyncs and enqueues the publish.
    pub fn finish(self) -> Result<PathBuf> {
        let Self {
            path,
            writer,
            queue,
            delete_local,
        } = self;
        let file = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("failed to flush {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", path.display()))?;
        queue.publish(path.clone(), delete_local);
        Ok(path)
    }
}

/// Writes `value` as pretty JSON to `path` and enqueues its publish, keeping the local copy.
pub fn write_json_file<T: Serialize>(queue: &FileQueue, path: &Path, value: &T) -> Result<()> {
    let mut file = QueuedFile::create(path, queue, false)?;
    file.write_json_pretty(value)?;
    file.finish()?;
    Ok(())
}
