//! Where periodically refreshed reference data comes from.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A JSON document on disk or behind an HTTP(S) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Url(String),
    File(PathBuf),
}

impl DataSource {
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            DataSource::Url(value.to_string())
        } else {
            DataSource::File(PathBuf::from(value))
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, client: &reqwest::Client) -> Result<T> {
        match self {
            DataSource::Url(url) => {
                let resp = client
                    .get(url)
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await
                    .with_context(|| format!("Failed to fetch {}", url))?;
                if !resp.status().is_success() {
                    bail!("Fetching {} returned HTTP {}", url, resp.status());
                }
                resp.json::<T>()
                    .await
                    .with_context(|| format!("Invalid JSON from {}", url))
            }
            DataSource::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
            }
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Url(url) => write!(f, "{}", url),
            DataSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Serialize for DataSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(DataSource::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn parse_distinguishes_urls() {
        assert_eq!(
            DataSource::parse("https://whimsy.apache.org/public/committee-info.json"),
            DataSource::Url("https://whimsy.apache.org/public/committee-info.json".to_string())
        );
        assert_eq!(
            DataSource::parse("/etc/selfserve/lists.json"),
            DataSource::File(PathBuf::from("/etc/selfserve/lists.json"))
        );
    }

    #[tokio::test]
    async fn fetch_json_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map.json");
        std::fs::write(&path, r#"{"alice": "alice@example.org"}"#).unwrap();

        let source = DataSource::File(path);
        let map: HashMap<String, String> = source.fetch_json(&reqwest::Client::new()).await.unwrap();
        assert_eq!(map["alice"], "alice@example.org");
    }

    #[tokio::test]
    async fn fetch_json_reports_bad_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let source = DataSource::File(path);
        let result: Result<HashMap<String, String>> = source.fetch_json(&reqwest::Client::new()).await;
        assert!(result.is_err());
    }
}
