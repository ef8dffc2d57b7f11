//! Core domain model for the order tracker sync: upstream records, canonical
//! sheet rows, the known-id set and per-cycle results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ordersync-core";

/// Upstream order identifier.
pub type OrderId = u64;

/// Fixed prefix of the synthesized order code (`OS-<id>`).
pub const ORDER_CODE_PREFIX: &str = "OS-";

/// Header row written at [`HEADER_ORIGIN`] on every cycle.
pub const HEADER: [&str; 10] = [
    "ID",
    "Order",
    "Client",
    "Vehicle",
    "Status",
    "Type",
    "Created At",
    "Phone",
    "City",
    "Last Updated",
];

/// Upstream `created_at` format and the format of the sync stamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const HEADER_ORIGIN: &str = "A1";
pub const DATA_ORIGIN: &str = "A2";

/// Opaque credential material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Order as returned by `GET /api/get_orders`. Only `id` is guaranteed.
///
/// Text fields accept strings, numbers or booleans; anything else (null,
/// nested values) is treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct RawOrder {
    #[serde(deserialize_with = "order_id")]
    pub id: OrderId,
    #[serde(default, deserialize_with = "lenient_text")]
    pub client_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub plate_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub type_order: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub status_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub created_at: Option<String>,
    #[serde(
        default,
        rename = "client_tab_client_phone",
        deserialize_with = "lenient_text"
    )]
    pub phone: Option<String>,
    #[serde(
        default,
        rename = "client_tab_client_address_city",
        deserialize_with = "lenient_text"
    )]
    pub city: Option<String>,
}

impl RawOrder {
    pub fn with_id(id: OrderId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

fn order_id<'de, D>(deserializer: D) -> Result<OrderId, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("order id {n} is not a non-negative integer"))),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("order id {s:?} is not numeric"))),
        other => Err(D::Error::custom(format!("unexpected order id {other}"))),
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    })
}

/// One value written to the destination grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Int(u64),
    Text(String),
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

/// Display-ready row; always the full arity of [`HEADER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalRow {
    pub id: OrderId,
    pub order_code: String,
    pub client_name: String,
    pub plate_number: String,
    pub status: String,
    pub order_type: String,
    /// Upstream creation timestamp, unparsed.
    pub created_at: String,
    pub phone: String,
    pub city: String,
    /// Wall-clock time of this cycle's normalization, never from upstream.
    pub synced_at: String,
}

impl CanonicalRow {
    pub fn to_cells(&self) -> Vec<Cell> {
        vec![
            Cell::Int(self.id),
            Cell::Text(self.order_code.clone()),
            Cell::Text(self.client_name.clone()),
            Cell::Text(self.plate_number.clone()),
            Cell::Text(self.status.clone()),
            Cell::Text(self.order_type.clone()),
            Cell::Text(self.created_at.clone()),
            Cell::Text(self.phone.clone()),
            Cell::Text(self.city.clone()),
            Cell::Text(self.synced_at.clone()),
        ]
    }
}

pub fn header_cells() -> Vec<Cell> {
    HEADER.iter().map(|h| Cell::from(*h)).collect()
}

/// Identifiers observed as of the last successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownIds(BTreeSet<OrderId>);

impl KnownIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: OrderId) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: OrderId) -> bool {
        self.0.insert(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ascending order.
    pub fn iter(&self) -> impl Iterator<Item = OrderId> + '_ {
        self.0.iter().copied()
    }

    /// Ids in `self` that `known` does not contain, ascending.
    pub fn difference(&self, known: &KnownIds) -> Vec<OrderId> {
        self.0.difference(&known.0).copied().collect()
    }
}

impl FromIterator<OrderId> for KnownIds {
    fn from_iter<I: IntoIterator<Item = OrderId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-label counts over the rows written in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderBreakdown {
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

impl OrderBreakdown {
    pub fn from_rows(rows: &[CanonicalRow]) -> Self {
        let mut breakdown = Self::default();
        for row in rows {
            *breakdown.by_status.entry(row.status.clone()).or_default() += 1;
            *breakdown.by_type.entry(row.order_type.clone()).or_default() += 1;
        }
        breakdown
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Destination rewritten and known ids persisted.
    Synced,
    /// Upstream yielded nothing; destination and known ids untouched.
    NoRecords { reason: Option<String> },
    ConnectionFailed(String),
    /// Destination may be partially written; known ids untouched.
    WriteFailed(String),
    /// Destination rewritten but the known-id set could not be saved.
    PersistFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncCycleResult {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub new_count: usize,
    pub total_count: usize,
    pub success: bool,
    pub outcome: CycleOutcome,
    pub pages_fetched: u32,
    /// Pagination stopped on an error after at least one accepted page.
    pub truncated: bool,
    /// Rows of newly seen ids, in written order.
    pub new_orders: Vec<CanonicalRow>,
    pub breakdown: OrderBreakdown,
}

impl SyncCycleResult {
    /// A result for a cycle that stopped before writing anything.
    pub fn aborted(started_at: DateTime<Local>, outcome: CycleOutcome) -> Self {
        Self {
            started_at,
            finished_at: Local::now(),
            new_count: 0,
            total_count: 0,
            success: false,
            outcome,
            pages_fetched: 0,
            truncated: false,
            new_orders: Vec::new(),
            breakdown: OrderBreakdown::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination unavailable: {0}")]
    Connection(String),
    #[error("destination write failed: {0}")]
    Write(String),
}

/// Acquires a writable handle to the destination grid.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Human-readable location of the destination, for logs and outcomes.
    fn location(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn GridWriter>, DestinationError>;
}

/// Full-replace operations against a key-value grid.
#[async_trait]
pub trait GridWriter: Send {
    async fn clear(&mut self) -> Result<(), DestinationError>;

    /// Writes `rows` as a contiguous block whose top-left cell is `origin` (A1 notation).
    async fn write_rows(&mut self, origin: &str, rows: &[Vec<Cell>]) -> Result<(), DestinationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_order_tolerates_missing_and_mistyped_fields() {
        let raw: RawOrder = serde_json::from_str(
            r#"{"id":"42","client_name":null,"type_order":2,"status":"A","extra":{"x":1}}"#,
        )
        .unwrap();
        assert_eq!(raw.id, 42);
        assert_eq!(raw.client_name, None);
        assert_eq!(raw.type_order.as_deref(), Some("2"));
        assert_eq!(raw.status.as_deref(), Some("A"));
        assert_eq!(raw.created_at, None);
    }

    #[test]
    fn raw_order_maps_nested_contact_keys() {
        let raw: RawOrder = serde_json::from_str(
            r#"{"id":7,"client_tab_client_phone":"11 99999-0000","client_tab_client_address_city":"Campinas"}"#,
        )
        .unwrap();
        assert_eq!(raw.phone.as_deref(), Some("11 99999-0000"));
        assert_eq!(raw.city.as_deref(), Some("Campinas"));
    }

    #[test]
    fn raw_order_without_usable_id_is_rejected() {
        assert!(serde_json::from_str::<RawOrder>(r#"{"client_name":"x"}"#).is_err());
        assert!(serde_json::from_str::<RawOrder>(r#"{"id":"abc"}"#).is_err());
        assert!(serde_json::from_str::<RawOrder>(r#"{"id":-3}"#).is_err());
    }

    #[test]
    fn known_ids_difference_is_fetched_minus_known() {
        let known: KnownIds = [1, 2, 3].into_iter().collect();
        let fetched: KnownIds = [2, 3, 4, 5].into_iter().collect();
        assert_eq!(fetched.difference(&known), vec![4, 5]);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("$2y$10$abcdef");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert_eq!(secret.expose(), "$2y$10$abcdef");
    }

    #[test]
    fn cells_serialize_as_plain_json_values() {
        let cells = vec![Cell::Int(10), Cell::from("OS-10")];
        assert_eq!(serde_json::to_string(&cells).unwrap(), r#"[10,"OS-10"]"#);
    }

    #[test]
    fn canonical_row_has_header_arity() {
        let row = CanonicalRow {
            id: 1,
            order_code: "OS-1".into(),
            client_name: String::new(),
            plate_number: String::new(),
            status: String::new(),
            order_type: "Other".into(),
            created_at: String::new(),
            phone: String::new(),
            city: String::new(),
            synced_at: "2026-01-01 00:00:00".into(),
        };
        assert_eq!(row.to_cells().len(), HEADER.len());
    }
}
