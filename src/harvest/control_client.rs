use crate::harvest::stats::StatsSnapshot;
use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use std::thread;
use std::time::{Duration, Instant};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Talks to a harvester's control server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    secret_key: Option<String>,
    client: Client,
}

impl ControlClient {
    /// `host` is `host:port` or a full `http://` URL.
    pub fn new(host: &str, secret_key: Option<&str>) -> Result<Self> {
        let host = host.trim().trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            base,
            secret_key: secret_key.map(str::to_string),
            client,
        })
    }

    fn get(&self, endpoint: &str) -> Result<Response> {
        let url = format!("{}{endpoint}", self.base);
        let mut request = self.client.get(&url);
        if let Some(secret) = &self.secret_key {
            request = request.query(&[("secret_key", secret)]);
        }
        let response = request
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("{url} failed with status {}", response.status());
        }
        Ok(response)
    }

    pub fn fetch_status(&self) -> Result<StatsSnapshot> {
        self.get("/")?
            .json()
            .context("invalid status payload from harvester")
    }

    pub fn send_stop(&self) -> Result<()> {
        self.get("/stop").map(drop)
    }

    pub fn send_shutdown(&self) -> Result<()> {
        self.get("/shutdown").map(drop)
    }

    pub fn is_stopped(&self) -> Result<bool> {
        let body = self.get("/is_stopped")?.text()?;
        Ok(body.trim() == "true")
    }

    /// Polls until the harvester reports stopped or goes away.
    ///
    /// A refused connection counts as stopped. Returns false on timeout.
    pub fn wait_for_stopped(&self, poll: Duration, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.is_stopped() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) if is_connect_error(&err) => return Ok(true),
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(poll);
        }
    }
}

fn is_connect_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(reqwest::Error::is_connect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_forms_are_normalized() {
        let client = ControlClient::new("10.0.0.5:8080/", None).expect("client");
        assert_eq!(client.base, "http://10.0.0.5:8080");
        let client = ControlClient::new("https://harvester.example", Some("k")).expect("client");
        assert_eq!(client.base, "https://harvester.example");
    }

    #[test]
    fn gone_harvester_counts_as_stopped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client = ControlClient::new(&addr.to_string(), None).expect("client");
        let stopped = client
            .wait_for_stopped(Duration::from_millis(10), Duration::from_millis(50))
            .expect("wait");
        assert!(stopped);
    }
}
