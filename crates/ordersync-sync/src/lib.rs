//! Sync orchestration: configuration, the per-cycle engine, row ordering
//! and the repeating scheduler.

pub mod config;
pub mod engine;
pub mod ordering;
pub mod schedule;

pub use config::{LogFormat, ServiceCredentials, SyncConfig, DEFAULT_BASE_URL};
pub use engine::{write_snapshot, CyclePhase, EngineSettings, SyncEngine};
pub use ordering::{order_rows, parse_created_at, OrderingPolicy};
pub use schedule::{run_scheduled, CycleReporter, Schedule};

pub const CRATE_NAME: &str = "ordersync-sync";
