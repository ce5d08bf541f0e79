//! HTTP control surface for a running session.
//!
//! `GET /` returns the stats snapshot. `/stop`, `/is_stopped` and `/shutdown` take a
//! `secret_key` query parameter that must match the configured secret.

use crate::harvest::signals::SessionSignals;
use crate::harvest::stats::HarvestStats;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ControlState {
    stats: Arc<HarvestStats>,
    signals: SessionSignals,
    secret_key: Option<Arc<str>>,
}

impl ControlState {
    fn authorized(&self, params: &SecretParams) -> bool {
        match &self.secret_key {
            None => true,
            Some(secret) => params.secret_key.as_deref() == Some(&**secret),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecretParams {
    secret_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub bind: String,
    pub port: u16,
    pub secret_key: Option<String>,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 80,
            secret_key: None,
        }
    }
}

pub struct ControlServer {
    addr: SocketAddr,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn start(
        options: &ControlOptions,
        stats: Arc<HarvestStats>,
        signals: SessionSignals,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind((options.bind.as_str(), options.port)).with_context(|| {
                format!(
                    "failed to bind control server to {}:{}",
                    options.bind, options.port
                )
            })?;
        listener
            .set_nonblocking(true)
            .context("failed to configure control listener")?;
        let addr = listener.local_addr().context("control listener has no address")?;

        let state = ControlState {
            stats,
            signals,
            secret_key: options.secret_key.as_deref().map(Arc::from),
        };
        let token = CancellationToken::new();
        let server_token = token.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build control server runtime")?;

        let handle = thread::Builder::new()
            .name("control-server".to_string())
            .spawn(move || {
                let served = runtime.block_on(serve(listener, state, server_token));
                if let Err(err) = served {
                    warn!("control server stopped: {err:#}");
                }
            })
            .context("failed to spawn control server thread")?;

        info!(%addr, "control server listening");
        Ok(Self {
            addr,
            token,
            handle: Some(handle),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("control server thread panicked");
            }
            debug!(addr = %self.addr, "control server stopped");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: TcpListener,
    state: ControlState,
    token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)
        .context("failed to register control listener")?;

    let app = Router::new()
        .route("/", get(handle_status))
        .route("/stop", get(handle_stop))
        .route("/is_stopped", get(handle_is_stopped))
        .route("/shutdown", get(handle_shutdown))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("control server failed")
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

async fn handle_status(State(state): State<ControlState>) -> impl IntoResponse {
    axum::Json(state.stats.snapshot())
}

async fn handle_stop(
    State(state): State<ControlState>,
    Query(params): Query<SecretParams>,
) -> Response {
    if !state.authorized(&params) {
        return unauthorized();
    }
    debug!("stop requested");
    state.signals.stop.set();
    "Stopping (but not shutting down) ...".into_response()
}

async fn handle_is_stopped(
    State(state): State<ControlState>,
    Query(params): Query<SecretParams>,
) -> Response {
    if !state.authorized(&params) {
        return unauthorized();
    }
    axum::Json(state.signals.stopped.is_set()).into_response()
}

async fn handle_shutdown(
    State(state): State<ControlState>,
    Query(params): Query<SecretParams>,
) -> Response {
    if !state.authorized(&params) {
        return unauthorized();
    }
    debug!("shutdown requested");
    state.signals.terminate();
    "Stopping and shutting down...".into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::control_client::ControlClient;
    use crate::harvest::util::utc_now;

    fn start(secret: Option<&str>) -> (ControlServer, SessionSignals, Arc<HarvestStats>) {
        let stats = Arc::new(HarvestStats::new("foo", utc_now()));
        let signals = SessionSignals::new();
        let options = ControlOptions {
            bind: "127.0.0.1".to_string(),
            port: 0,
            secret_key: secret.map(str::to_string),
        };
        let server =
            ControlServer::start(&options, Arc::clone(&stats), signals.clone()).expect("start");
        (server, signals, stats)
    }

    #[test]
    fn status_reports_live_counters() {
        let (server, _signals, stats) = start(Some("s3cret"));
        stats.items.increment(5);
        let client = ControlClient::new(&server.local_addr().to_string(), None).expect("client");
        let snapshot = client.fetch_status().expect("status");
        assert_eq!(snapshot.collection_id, "foo");
        assert_eq!(snapshot.items, 5);
        assert!(snapshot.harvest_end_timestamp.is_none());
        server.shutdown();
    }

    #[test]
    fn wrong_secret_is_rejected_without_effect() {
        let (server, signals, _stats) = start(Some("s3cret"));
        let host = server.local_addr().to_string();

        let bad = ControlClient::new(&host, Some("nope")).expect("client");
        assert!(bad.send_stop().is_err());
        assert!(bad.send_shutdown().is_err());
        assert!(bad.is_stopped().is_err());
        assert!(!signals.stop.is_set());
        assert!(!signals.shutdown.is_set());

        let good = ControlClient::new(&host, Some("s3cret")).expect("client");
        good.send_stop().expect("stop");
        assert!(signals.stop.is_set());
        assert!(!signals.shutdown.is_set());
        assert!(!good.is_stopped().expect("is_stopped"));
        signals.stopped.set();
        assert!(good.is_stopped().expect("is_stopped"));
        good.send_shutdown().expect("shutdown");
        assert!(signals.shutdown.is_set());
        server.shutdown();
    }

    #[test]
    fn open_when_no_secret_configured() {
        let (server, signals, _stats) = start(None);
        let client = ControlClient::new(&server.local_addr().to_string(), None).expect("client");
        client.send_shutdown().expect("shutdown");
        assert!(signals.stop.is_set());
        assert!(signals.shutdown.is_set());
        server.shutdown();
    }
}
