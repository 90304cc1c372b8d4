use anyhow::{bail, Result};
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// External registry of taken user ids (`GET <url>?id=<userid>` returning
/// `{"exists": bool}`).
#[derive(Debug, Clone)]
pub struct UseridRegistry {
    url: String,
    client: reqwest::Client,
}

impl UseridRegistry {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    /// A reply without the `exists` field counts as taken.
    pub async fn exists(&self, userid: &str) -> Result<bool> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("id", userid)])
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("userid registry returned HTTP {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await?;
        Ok(body.get("exists").and_then(|v| v.as_bool()).unwrap_or(true))
    }
}
