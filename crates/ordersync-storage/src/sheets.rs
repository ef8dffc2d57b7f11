//! Google Sheets destination: service-account auth plus the v4 values API.
//!
//! `connect` exchanges a signed JWT for an access token and resolves the
//! first worksheet; the returned [`SheetsWorksheet`] only clears and writes
//! whole blocks.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ordersync_core::{Cell, DestinationConnector, DestinationError, GridWriter};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info_span, Instrument};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: i64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Subset of a service-account JSON key needed to mint access tokens.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing service-account credentials")
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Extracts the id from `https://docs.google.com/spreadsheets/d/<id>/...`;
/// a bare id is returned unchanged.
pub fn spreadsheet_id_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if !trimmed.contains('/') {
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    let rest = trimmed.split("/spreadsheets/d/").nth(1)?;
    let id = rest.split(['/', '?', '#']).next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// `Sheet1` -> `'Sheet1'`, with embedded quotes doubled.
pub fn quote_sheet_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

pub fn a1_range(title: &str, origin: &str) -> String {
    format!("{}!{origin}", quote_sheet_title(title))
}

#[derive(Debug, Clone)]
pub struct SheetsConnector {
    http: reqwest::Client,
    key: ServiceAccountKey,
    spreadsheet_url: String,
    spreadsheet_id: String,
    api_base: String,
}

impl SheetsConnector {
    pub fn new(key: ServiceAccountKey, spreadsheet_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let spreadsheet_id = spreadsheet_id_from_url(spreadsheet_url)
            .with_context(|| format!("no spreadsheet id in {spreadsheet_url}"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building sheets client")?;
        Ok(Self {
            http,
            key,
            spreadsheet_url: spreadsheet_url.to_string(),
            spreadsheet_id,
            api_base: SHEETS_API_BASE.to_string(),
        })
    }

    fn signed_assertion(&self) -> Result<String, DestinationError> {
        let iat = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| DestinationError::Connection(format!("invalid service-account key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| DestinationError::Connection(format!("signing token request: {e}")))
    }

    async fn access_token(&self) -> Result<String, DestinationError> {
        let assertion = self.signed_assertion()?;
        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DestinationError::Connection(format!("token request: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DestinationError::Connection(format!(
                "token endpoint returned {status}"
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| DestinationError::Connection(format!("token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn first_sheet_title(&self, token: &str) -> Result<String, DestinationError> {
        let mut url = sheets_api_url(&self.api_base, &self.spreadsheet_id, &[])
            .map_err(DestinationError::Connection)?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");

        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DestinationError::Connection(format!("spreadsheet lookup: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DestinationError::Connection(format!(
                "spreadsheet lookup returned {status}"
            )));
        }
        let meta: SpreadsheetMeta = resp
            .json()
            .await
            .map_err(|e| DestinationError::Connection(format!("spreadsheet metadata: {e}")))?;
        meta.sheets
            .into_iter()
            .next()
            .map(|s| s.properties.title)
            .ok_or_else(|| DestinationError::Connection("spreadsheet has no worksheets".to_string()))
    }
}

#[async_trait]
impl DestinationConnector for SheetsConnector {
    fn location(&self) -> String {
        self.spreadsheet_url.clone()
    }

    async fn connect(&self) -> Result<Box<dyn GridWriter>, DestinationError> {
        let span = info_span!("sheets_connect", spreadsheet_id = %self.spreadsheet_id);
        async {
            let token = self.access_token().await?;
            let sheet_title = self.first_sheet_title(&token).await?;
            debug!(sheet_title = %sheet_title, "resolved worksheet");
            Ok::<_, DestinationError>(Box::new(SheetsWorksheet {
                http: self.http.clone(),
                token,
                api_base: self.api_base.clone(),
                spreadsheet_id: self.spreadsheet_id.clone(),
                sheet_title,
            }) as Box<dyn GridWriter>)
        }
        .instrument(span)
        .await
    }
}

fn sheets_api_url(api_base: &str, spreadsheet_id: &str, tail: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(api_base).map_err(|e| format!("invalid sheets api base {api_base}: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("sheets api base {api_base} cannot carry a path"))?
        .pop_if_empty()
        .push("spreadsheets")
        .push(spreadsheet_id)
        .extend(tail);
    Ok(url)
}

/// Handle to one worksheet, valid for the lifetime of the access token.
pub struct SheetsWorksheet {
    http: reqwest::Client,
    token: String,
    api_base: String,
    spreadsheet_id: String,
    sheet_title: String,
}

#[async_trait]
impl GridWriter for SheetsWorksheet {
    async fn clear(&mut self) -> Result<(), DestinationError> {
        let segment = format!("{}:clear", quote_sheet_title(&self.sheet_title));
        let url = sheets_api_url(&self.api_base, &self.spreadsheet_id, &["values", segment.as_str()])
            .map_err(DestinationError::Write)?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| DestinationError::Write(format!("clear: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DestinationError::Write(format!("clear returned {status}")));
        }
        Ok(())
    }

    async fn write_rows(&mut self, origin: &str, rows: &[Vec<Cell>]) -> Result<(), DestinationError> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = a1_range(&self.sheet_title, origin);
        let mut url = sheets_api_url(&self.api_base, &self.spreadsheet_id, &["values", range.as_str()])
            .map_err(DestinationError::Write)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let resp = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&json!({
                "range": range,
                "majorDimension": "ROWS",
                "values": rows,
            }))
            .send()
            .await
            .map_err(|e| DestinationError::Write(format!("update {origin}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DestinationError::Write(format!(
                "update {origin} returned {status}"
            )));
        }
        debug!(origin, rows = rows.len(), "wrote block");
        Ok(())
    }
}
