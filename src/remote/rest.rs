//! Vitals API REST client
//!
//! `GET {range_path}?patient_id&start&end` and `GET {latest_path}?limit` for
//! rows, `POST {decrypt_path}` for the remote decrypt collaborator.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Decryptor, RangeFetcher};
use crate::config::RemoteConfig;
use crate::models::RawRow;

#[derive(Clone)]
pub struct VitalsRestClient {
    client: Client,
    config: RemoteConfig,
}

impl VitalsRestClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build VitalsRestClient")?;

        Ok(Self { client, config })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Decrypt collaborator sharing this client's connection pool.
    pub fn decryptor(&self) -> RestDecryptor {
        RestDecryptor {
            client: self.client.clone(),
            url: self.url(&self.config.decrypt_path),
        }
    }

    async fn get_rows(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<RawRow>> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} {}: {}", path, status, text));
        }

        let body = resp
            .json::<Value>()
            .await
            .with_context(|| format!("Failed to parse {} response", path))?;
        parse_rows(body).with_context(|| format!("GET {}", path))
    }
}

/// Row listings are a JSON array; the API reports database errors as
/// `{"error": ...}` with a 200 status.
pub fn parse_rows(body: Value) -> Result<Vec<RawRow>> {
    match body {
        Value::Array(_) => Ok(serde_json::from_value(body)?),
        Value::Object(map) if map.contains_key("error") => {
            let error = map
                .get("error")
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .unwrap_or_default();
            bail!("remote error: {}", error)
        }
        other => bail!("unexpected row listing: {}", other),
    }
}

#[async_trait::async_trait]
impl RangeFetcher for VitalsRestClient {
    async fn fetch_by_seq_range(&self, patient_id: &str, start: u64, end: u64) -> Result<Vec<RawRow>> {
        let query = [
            ("patient_id", patient_id.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ];
        self.get_rows(&self.config.range_path, &query).await
    }

    async fn fetch_latest(&self, limit: u64) -> Result<Vec<RawRow>> {
        self.get_rows(&self.config.latest_path, &[("limit", limit.to_string())])
            .await
    }
}

#[derive(Debug, Serialize)]
struct DecryptRequest<'a> {
    encrypted_data: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    decrypted_data: String,
}

/// Remote decrypt collaborator (`POST /decrypt`).
#[derive(Clone)]
pub struct RestDecryptor {
    client: Client,
    url: String,
}

#[async_trait::async_trait]
impl Decryptor for RestDecryptor {
    async fn decrypt(&self, blob: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&DecryptRequest { encrypted_data: blob })
            .send()
            .await
            .context("POST decrypt failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST decrypt {}: {}", status, text));
        }

        let body = resp
            .json::<DecryptResponse>()
            .await
            .context("Failed to parse decrypt response")?;
        Ok(body.decrypted_data)
    }
}
