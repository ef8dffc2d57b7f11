//! Durable known-id state, outbound HTTP, and the Google Sheets destination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ordersync_core::{KnownIds, OrderId};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod sheets;

pub use sheets::{ServiceAccountKey, SheetsConnector, SheetsWorksheet};

pub const CRATE_NAME: &str = "ordersync-storage";

/// Line-oriented file of order ids, one per line, ascending.
#[derive(Debug, Clone)]
pub struct KnownIdStore {
    path: PathBuf,
}

impl KnownIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, unreadable and corrupt files all load as the empty set.
    pub async fn load(&self) -> KnownIds {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "known-id store missing; starting empty");
                return KnownIds::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "known-id store unreadable; starting empty");
                return KnownIds::new();
            }
        };

        match decode_known_ids(&text) {
            Some(ids) => ids,
            None => {
                warn!(path = %self.path.display(), "known-id store corrupt; starting empty");
                KnownIds::new()
            }
        }
    }

    /// Replace the stored set via temp file + rename; the previous file
    /// survives any failure before the rename.
    pub async fn save(&self, ids: &KnownIds) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating known-id directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "known_ids".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let result = write_and_rename(&temp_path, &self.path, encode_known_ids(ids).as_bytes()).await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

async fn write_and_rename(temp_path: &Path, final_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp known-id file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp known-id file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp known-id file {}", temp_path.display()))?;
    drop(file);

    fs::rename(temp_path, final_path).await.with_context(|| {
        format!(
            "atomically renaming temp known-id file {} -> {}",
            temp_path.display(),
            final_path.display()
        )
    })
}

pub fn encode_known_ids(ids: &KnownIds) -> String {
    ids.iter().map(|id| format!("{id}\n")).collect()
}

/// `None` when any non-blank line is not an integer id.
pub fn decode_known_ids(text: &str) -> Option<KnownIds> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse::<OrderId>().ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Errors never carry the query string, which holds the credential.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt GET client. Pagination callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Returns the body of a successful response.
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, HttpError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| HttpError::Request(e.without_url()))?;

        let status = resp.status();
        if !status.is_success() {
            let mut final_url = resp.url().clone();
            final_url.set_query(None);
            return Err(HttpError::HttpStatus {
                status: status.as_u16(),
                url: final_url.to_string(),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| HttpError::Request(e.without_url()))?
            .to_vec();
        Ok(body)
    }
}
