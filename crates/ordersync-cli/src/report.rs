use std::collections::BTreeMap;
use std::fmt::Write as _;

use ordersync_core::{CycleOutcome, SyncCycleResult};

/// New orders listed individually before collapsing into a count.
const NEW_ORDER_PREVIEW: usize = 3;

pub fn render_cycle(cycle: u64, result: &SyncCycleResult) -> String {
    let mut out = String::new();
    let elapsed = result.finished_at - result.started_at;
    let _ = writeln!(
        out,
        "cycle {cycle} at {}: {} ({} ms)",
        result.started_at.format("%Y-%m-%d %H:%M:%S"),
        outcome_line(&result.outcome),
        elapsed.num_milliseconds()
    );

    if result.total_count == 0 {
        return out;
    }

    let _ = writeln!(
        out,
        "  total={} new={} pages={}{}",
        result.total_count,
        result.new_count,
        result.pages_fetched,
        if result.truncated { " (truncated)" } else { "" }
    );

    for row in result.new_orders.iter().take(NEW_ORDER_PREVIEW) {
        let _ = writeln!(
            out,
            "  + {} {} [{}] {}",
            row.order_code, row.client_name, row.status, row.created_at
        );
    }
    if result.new_orders.len() > NEW_ORDER_PREVIEW {
        let _ = writeln!(out, "  ... and {} more", result.new_orders.len() - NEW_ORDER_PREVIEW);
    }

    let _ = writeln!(out, "  by status: {}", counts(&result.breakdown.by_status));
    let _ = writeln!(out, "  by type: {}", counts(&result.breakdown.by_type));
    out
}

fn outcome_line(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Synced => "synced".to_string(),
        CycleOutcome::NoRecords { reason: None } => "no records returned; sheet left as is".to_string(),
        CycleOutcome::NoRecords { reason: Some(reason) } => {
            format!("no records returned ({reason}); sheet left as is")
        }
        CycleOutcome::ConnectionFailed(detail) => format!("could not reach the sheet: {detail}"),
        CycleOutcome::WriteFailed(detail) => format!("sheet write failed: {detail}"),
        CycleOutcome::PersistFailed(detail) => format!("sheet written but known ids not saved: {detail}"),
    }
}

fn counts(map: &BTreeMap<String, usize>) -> String {
    map.iter()
        .map(|(label, n)| {
            let label = if label.is_empty() { "(blank)" } else { label.as_str() };
            format!("{label}={n}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
