//! Maps upstream orders into display rows. Total: every field has a fallback.

use chrono::{DateTime, Local};
use ordersync_core::{CanonicalRow, OrderId, RawOrder, ORDER_CODE_PREFIX, TIMESTAMP_FORMAT};

pub const OTHER_TYPE_LABEL: &str = "Other";

fn status_label(code: &str) -> Option<&'static str> {
    match code {
        "A" => Some("Active"),
        "C" => Some("Cancelled"),
        "CD" => Some("Completed"),
        "P" => Some("Pending"),
        _ => None,
    }
}

fn type_label(code: &str) -> Option<&'static str> {
    match code {
        "1" => Some("Installation"),
        "2" => Some("Maintenance"),
        "3" => Some("Removal"),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Table label, else the upstream free-text label, else the raw code, else empty.
pub fn resolve_status(code: Option<&str>, status_text: Option<&str>) -> String {
    if let Some(label) = code.and_then(|c| status_label(c.trim())) {
        return label.to_string();
    }
    non_empty(status_text)
        .or(non_empty(code))
        .unwrap_or_default()
        .to_string()
}

pub fn resolve_type(code: Option<&str>) -> String {
    code.and_then(|c| type_label(c.trim()))
        .unwrap_or(OTHER_TYPE_LABEL)
        .to_string()
}

pub fn order_code(id: OrderId) -> String {
    format!("{ORDER_CODE_PREFIX}{id}")
}

/// Normalizes one order stamped with the current local time.
pub fn normalize(raw: &RawOrder) -> CanonicalRow {
    normalize_at(raw, Local::now())
}

pub fn normalize_at(raw: &RawOrder, synced_at: DateTime<Local>) -> CanonicalRow {
    normalize_with_stamp(raw, &synced_at.format(TIMESTAMP_FORMAT).to_string())
}

/// Normalizes a whole batch with one shared sync stamp.
pub fn normalize_all(raws: &[RawOrder], synced_at: DateTime<Local>) -> Vec<CanonicalRow> {
    let stamp = synced_at.format(TIMESTAMP_FORMAT).to_string();
    raws.iter().map(|raw| normalize_with_stamp(raw, &stamp)).collect()
}

fn normalize_with_stamp(raw: &RawOrder, stamp: &str) -> CanonicalRow {
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    CanonicalRow {
        id: raw.id,
        order_code: order_code(raw.id),
        client_name: text(&raw.client_name),
        plate_number: text(&raw.plate_number),
        status: resolve_status(raw.status.as_deref(), raw.status_text.as_deref()),
        order_type: resolve_type(raw.type_order.as_deref()),
        created_at: text(&raw.created_at),
        phone: text(&raw.phone),
        city: text(&raw.city),
        synced_at: stamp.to_string(),
    }
}
