use crate::remote::BlobStore;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Plain HTTP object gateway.
///
/// Objects live at `<base>/<key>` and are written with `PUT`, read with `GET` and
/// removed with `DELETE`. Listing is `GET <base>/?prefix=<prefix>` answering a JSON
/// array of keys.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base: String,
    client: Client,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key.trim_start_matches('/'))
    }
}

impl BlobStore for HttpStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let response = self.client.put(self.url(key)).body(data.to_vec()).send()?;
        if !response.status().is_success() {
            anyhow::bail!("put {key} failed with status {}", response.status());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self.client.get(self.url(key)).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("get {key} failed with status {}", response.status());
        }
        Ok(Some(response.bytes()?.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.url(key)).send()?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        anyhow::bail!("delete {key} failed with status {status}")
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/", self.base))
            .query(&[("prefix", prefix)])
            .send()?;
        if !response.status().is_success() {
            anyhow::bail!("list {prefix} failed with status {}", response.status());
        }
        let mut keys: Vec<String> = response
            .json()
            .with_context(|| format!("invalid listing for {prefix}"))?;
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}
