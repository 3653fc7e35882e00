use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::FixtoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCatalogEntry")]
pub struct CatalogEntry {
    pub catalog_id: String,
    pub title: String,
    pub code_name: Option<String>,
    pub store: Option<String>,
}

/// Upstream payloads name the id `umu_id`, `ulwgl_id` or both.
#[derive(Deserialize)]
struct RawCatalogEntry {
    #[serde(default)]
    catalog_id: Option<String>,
    #[serde(default)]
    umu_id: Option<String>,
    #[serde(default)]
    ulwgl_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    title: String,
    #[serde(default, alias = "codename")]
    code_name: Option<String>,
    #[serde(default)]
    store: Option<String>,
}

impl TryFrom<RawCatalogEntry> for CatalogEntry {
    type Error = String;

    fn try_from(raw: RawCatalogEntry) -> Result<Self, Self::Error> {
        let catalog_id = raw
            .catalog_id
            .or(raw.umu_id)
            .or(raw.ulwgl_id)
            .ok_or_else(|| "missing field `catalog_id`".to_string())?;
        Ok(Self {
            catalog_id,
            title: raw.title,
            code_name: raw.code_name,
            store: raw.store,
        })
    }
}

pub trait CatalogApi {
    fn fetch_entries(&mut self) -> Result<Vec<CatalogEntry>>;
}

/// Failures surface on the first attempt unless `max_retries` is raised.
#[derive(Debug, Clone)]
pub struct CatalogClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl CatalogClientConfig {
    pub fn from_config(config: &FixtoolConfig) -> Self {
        Self {
            api_url: config.api_url(),
            user_agent: config.user_agent(),
            timeout_ms: 30_000,
            max_retries: 0,
            retry_delay_ms: 500,
        }
    }
}

pub struct CatalogClient {
    client: Client,
    config: CatalogClientConfig,
}

impl CatalogClient {
    pub fn new(config: CatalogClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self { client, config })
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        sleep(Duration::from_millis(
            self.config
                .retry_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        ));
    }
}

impl CatalogApi for CatalogClient {
    fn fetch_entries(&mut self) -> Result<Vec<CatalogEntry>> {
        for attempt in 0..=self.config.max_retries {
            debug!(url = %self.config.api_url, attempt, "requesting catalog");
            let response = self
                .client
                .get(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            warn!(%status, attempt, "catalog request failed, retrying");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("catalog request failed with HTTP {status}");
                    }
                    let body = response
                        .text()
                        .context("failed to read catalog response body")?;
                    return parse_catalog(&body);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!(%error, attempt, "catalog request failed, retrying");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call catalog API");
                }
            }
        }

        bail!("catalog request exhausted retry budget")
    }
}

/// Catalog read from a JSON file on disk instead of the remote API.
pub struct CatalogFile<'a> {
    path: &'a Path,
}

impl<'a> CatalogFile<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }
}

impl CatalogApi for CatalogFile<'_> {
    fn fetch_entries(&mut self) -> Result<Vec<CatalogEntry>> {
        load_catalog_file(self.path)
    }
}

pub fn load_catalog_file(path: &Path) -> Result<Vec<CatalogEntry>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_catalog(&content).with_context(|| format!("invalid catalog {}", path.display()))
}

pub fn parse_catalog(content: &str) -> Result<Vec<CatalogEntry>> {
    serde_json::from_str(content).context("failed to decode catalog JSON")
}

/// Entries sharing a catalog id, in the order the catalog lists them.
pub fn group_by_catalog_id(entries: Vec<CatalogEntry>) -> BTreeMap<String, Vec<CatalogEntry>> {
    let mut grouped: BTreeMap<String, Vec<CatalogEntry>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(entry.catalog_id.clone())
            .or_default()
            .push(entry);
    }
    grouped
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{CatalogApi, CatalogFile, group_by_catalog_id, parse_catalog};

    const SAMPLE: &str = r#"[
        {"title": "Grim Fandango Remastered", "store": "steam", "codename": "316720", "ulwgl_id": "ulwgl-316720", "notes": null},
        {"title": "Grim Fandango Remastered", "store": "gog", "codename": "1207658918", "ulwgl_id": "ulwgl-316720", "notes": null},
        {"title": null, "store": "egs", "codename": "Hydrangea", "ulwgl_id": "ulwgl-egs-hydrangea"}
    ]"#;

    #[test]
    fn parse_accepts_upstream_field_names() {
        let entries = parse_catalog(SAMPLE).expect("parse");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].catalog_id, "ulwgl-316720");
        assert_eq!(entries[0].code_name.as_deref(), Some("316720"));
        assert_eq!(entries[1].store.as_deref(), Some("gog"));
        assert_eq!(entries[2].title, "");
    }

    #[test]
    fn parse_accepts_canonical_field_names() {
        let entries = parse_catalog(
            r#"[{"catalog_id": "ulwgl-10", "title": "Counter-Strike", "code_name": "10"}]"#,
        )
        .expect("parse");
        assert_eq!(entries[0].catalog_id, "ulwgl-10");
        assert_eq!(entries[0].code_name.as_deref(), Some("10"));
    }

    #[test]
    fn parse_prefers_canonical_then_umu_id() {
        let entries = parse_catalog(
            r#"[
                {"title": "Hades", "codename": "1145360", "umu_id": "umu-1145360", "ulwgl_id": "ulwgl-1145360"},
                {"title": "Celeste", "catalog_id": "umu-504230", "umu_id": "umu-other"}
            ]"#,
        )
        .expect("parse");
        assert_eq!(entries[0].catalog_id, "umu-1145360");
        assert_eq!(entries[1].catalog_id, "umu-504230");
    }

    #[test]
    fn parse_rejects_entry_without_id() {
        let error = parse_catalog(r#"[{"title": "Nameless"}]"#).expect_err("must fail");
        assert!(format!("{error:#}").contains("catalog_id"));
    }

    #[test]
    fn grouping_keeps_catalog_order_within_id() {
        let grouped = group_by_catalog_id(parse_catalog(SAMPLE).expect("parse"));
        assert_eq!(grouped.len(), 2);
        let grim = &grouped["ulwgl-316720"];
        assert_eq!(grim.len(), 2);
        assert_eq!(grim[0].store.as_deref(), Some("steam"));
        assert_eq!(grim[1].store.as_deref(), Some("gog"));
    }

    #[test]
    fn catalog_file_reads_local_payload() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("catalog.json");
        fs::write(&path, SAMPLE).expect("write catalog");
        let entries = CatalogFile::new(&path).fetch_entries().expect("fetch");
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn catalog_file_rejects_invalid_json() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("catalog.json");
        fs::write(&path, "{not json").expect("write catalog");
        let error = CatalogFile::new(&path).fetch_entries().expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to decode catalog JSON"));
    }
}
