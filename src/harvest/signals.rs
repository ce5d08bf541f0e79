//! Stop, stopped and shutdown flags for a session, and the OS signal watcher
//! that trips them.

use crate::harvest::flag::Flag;
use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Session signals shared by the orchestrator, the collection task and the server.
#[derive(Debug, Clone, Default)]
pub struct SessionSignals {
    /// Wind the collection down; the process keeps running.
    pub stop: Flag,
    /// The collection phase has finished and the lock is released.
    pub stopped: Flag,
    /// The process may exit.
    pub shutdown: Flag,
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.stop.set();
        self.shutdown.set();
    }
}

/// Routes SIGINT and SIGTERM to [`SessionSignals::terminate`] until stopped.
///
/// Once started, the process no longer dies on those signals; the session
/// winds down, releases its lock and exits on its own.
pub struct SignalWatcher {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn start(signals: SessionSignals) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build signal watcher runtime")?;
        let token = CancellationToken::new();
        let watch_token = token.clone();

        let handle = thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::select! {
                        _ = termination_signal() => {
                            info!("termination signal received, stopping harvest");
                            signals.terminate();
                        }
                        _ = watch_token.cancelled() => {}
                    }
                });
            })
            .context("failed to spawn signal watcher thread")?;

        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("signal watcher thread panicked");
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!("cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_sets_stop_and_shutdown_only() {
        let signals = SessionSignals::new();
        signals.terminate();
        assert!(signals.stop.is_set());
        assert!(signals.shutdown.is_set());
        assert!(!signals.stopped.is_set());
    }

    #[test]
    fn watcher_stops_without_tripping_signals() {
        let signals = SessionSignals::new();
        let watcher = SignalWatcher::start(signals.clone()).expect("watcher");
        watcher.stop();
        assert!(!signals.stop.is_set());
        assert!(!signals.shutdown.is_set());
    }
}
