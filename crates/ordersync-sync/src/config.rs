//! Process configuration, loaded once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ordersync_core::Secret;
use ordersync_storage::ServiceAccountKey;

use crate::ordering::OrderingPolicy;

pub const DEFAULT_BASE_URL: &str = "https://sp.tracker-net.app";

/// Where the service-account JSON comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCredentials {
    Inline(Secret),
    File(PathBuf),
}

impl ServiceCredentials {
    pub fn load(&self) -> Result<ServiceAccountKey> {
        match self {
            Self::Inline(secret) => ServiceAccountKey::from_json(secret.expose()),
            Self::File(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ServiceAccountKey::from_json(&text)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?} (expected pretty or json)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Required to fetch; optional so `status` works without secrets.
    pub api_token: Option<Secret>,
    pub base_url: String,
    pub spreadsheet_url: Option<String>,
    pub credentials: ServiceCredentials,
    pub known_ids_path: PathBuf,
    pub poll_interval: Duration,
    pub sync_cron: Option<String>,
    pub http_timeout: Duration,
    pub page_delay: Duration,
    pub max_pages: u32,
    pub ordering: OrderingPolicy,
    pub user_agent: String,
    pub log_format: LogFormat,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let credentials = match var("GOOGLE_CREDENTIALS") {
            Some(blob) => ServiceCredentials::Inline(Secret::new(blob)),
            None => ServiceCredentials::File(
                var("GOOGLE_CREDENTIALS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("credentials.json")),
            ),
        };

        Ok(Self {
            api_token: var("USER_API_HASH").map(Secret::new),
            base_url: var("ORDERSYNC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            spreadsheet_url: var("GOOGLE_SHEETS_URL"),
            credentials,
            known_ids_path: var("ORDERSYNC_KNOWN_IDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("known_ids.txt")),
            poll_interval: Duration::from_secs(parse_var(&var, "ORDERSYNC_POLL_INTERVAL_SECS", 300)?),
            sync_cron: var("ORDERSYNC_SYNC_CRON"),
            http_timeout: Duration::from_secs(parse_var(&var, "ORDERSYNC_HTTP_TIMEOUT_SECS", 20)?),
            page_delay: Duration::from_millis(parse_var(&var, "ORDERSYNC_PAGE_DELAY_MS", 200)?),
            max_pages: parse_var(&var, "ORDERSYNC_MAX_PAGES", 500)?,
            ordering: parse_var(&var, "ORDERSYNC_ORDERING", OrderingPolicy::default())?,
            user_agent: var("ORDERSYNC_USER_AGENT").unwrap_or_else(|| "ordersync/0.1".to_string()),
            log_format: parse_var(&var, "ORDERSYNC_LOG_FORMAT", LogFormat::default())?,
        })
    }

    pub fn require_api_token(&self) -> Result<&Secret> {
        self.api_token
            .as_ref()
            .context("USER_API_HASH is not set")
    }

    pub fn require_spreadsheet_url(&self) -> Result<&str> {
        self.spreadsheet_url
            .as_deref()
            .context("GOOGLE_SHEETS_URL is not set")
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert!(config.api_token.is_none());
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.page_delay, Duration::from_millis(200));
        assert_eq!(config.max_pages, 500);
        assert_eq!(config.ordering, OrderingPolicy::Partition);
        assert_eq!(config.known_ids_path, PathBuf::from("known_ids.txt"));
        assert_eq!(config.credentials, ServiceCredentials::File(PathBuf::from("credentials.json")));
        assert!(config.require_api_token().is_err());
        assert!(config.require_spreadsheet_url().is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("USER_API_HASH", "hash"),
            ("GOOGLE_SHEETS_URL", "https://docs.google.com/spreadsheets/d/abc"),
            ("GOOGLE_CREDENTIALS", "{}"),
            ("ORDERSYNC_POLL_INTERVAL_SECS", "60"),
            ("ORDERSYNC_ORDERING", "sentinel"),
            ("ORDERSYNC_LOG_FORMAT", "json"),
            ("ORDERSYNC_SYNC_CRON", "0 */5 * * * *"),
        ])
        .unwrap();
        assert_eq!(config.require_api_token().unwrap().expose(), "hash");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.ordering, OrderingPolicy::Sentinel);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.sync_cron.as_deref(), Some("0 */5 * * * *"));
        assert!(matches!(config.credentials, ServiceCredentials::Inline(_)));
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = config_from(&[("ORDERSYNC_MAX_PAGES", "many")]).unwrap_err();
        assert!(err.to_string().contains("ORDERSYNC_MAX_PAGES"));
    }

    #[test]
    fn debug_output_never_contains_secrets() {
        let config = config_from(&[
            ("USER_API_HASH", "super-secret-hash"),
            ("GOOGLE_CREDENTIALS", r#"{"private_key":"pk"}"#),
        ])
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-hash"));
        assert!(!rendered.contains("private_key"));
    }
}
