//! Deterministic newest-first ordering of canonical rows.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use ordersync_core::{CanonicalRow, TIMESTAMP_FORMAT};
use serde::{Deserialize, Serialize};

/// Placement of rows whose `created_at` does not parse.
///
/// Both policies put undated rows after every dated row. `Partition` keeps
/// undated rows in input order; `Sentinel` gives them the minimum instant
/// and breaks their ties by the raw string, descending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    #[default]
    Partition,
    Sentinel,
}

impl FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partition" => Ok(Self::Partition),
            "sentinel" => Ok(Self::Sentinel),
            other => Err(format!("unknown ordering policy {other:?} (expected partition or sentinel)")),
        }
    }
}

impl fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Partition => "partition",
            Self::Sentinel => "sentinel",
        })
    }
}

/// Parses only the exact upstream format: the value must re-render to the
/// same string, so unpadded fields, extra whitespace and signed years fail.
/// Empty strings and the all-zero date count as undated too.
pub fn parse_created_at(value: &str) -> Option<NaiveDateTime> {
    let ts = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()?;
    (ts.format(TIMESTAMP_FORMAT).to_string() == value).then_some(ts)
}

/// Stable sort, newest first; equal timestamps keep input order.
pub fn order_rows(rows: Vec<CanonicalRow>, policy: OrderingPolicy) -> Vec<CanonicalRow> {
    match policy {
        OrderingPolicy::Partition => partition_order(rows),
        OrderingPolicy::Sentinel => sentinel_order(rows),
    }
}

fn partition_order(rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
    let mut dated = Vec::with_capacity(rows.len());
    let mut undated = Vec::new();
    for row in rows {
        match parse_created_at(&row.created_at) {
            Some(ts) => dated.push((ts, row)),
            None => undated.push(row),
        }
    }
    dated.sort_by(|a, b| b.0.cmp(&a.0));
    dated.into_iter().map(|(_, row)| row).chain(undated).collect()
}

fn sentinel_order(rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
    let mut keyed: Vec<_> = rows
        .into_iter()
        .map(|row| (parse_created_at(&row.created_at).unwrap_or(NaiveDateTime::MIN), row))
        .collect();
    keyed.sort_by(|a, b| descending(a, b));
    keyed.into_iter().map(|(_, row)| row).collect()
}

/// Raw-string tiebreak among equal keys: the zero date sorts ahead of an
/// empty value rather than tying with it.
fn descending(a: &(NaiveDateTime, CanonicalRow), b: &(NaiveDateTime, CanonicalRow)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| b.1.created_at.cmp(&a.1.created_at))
}
