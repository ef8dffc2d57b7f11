//! One synchronization cycle: connect, fetch, diff, write, persist.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use ordersync_adapters::normalize::normalize_all;
use ordersync_adapters::{PaginationPolicy, RecordFetcher};
use ordersync_core::{
    header_cells, CanonicalRow, CycleOutcome, DestinationConnector, DestinationError, GridWriter,
    KnownIds, OrderBreakdown, Secret, SyncCycleResult, DATA_ORIGIN, HEADER_ORIGIN,
};
use ordersync_storage::{HttpClientConfig, HttpFetcher, KnownIdStore, SheetsConnector};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::ordering::{order_rows, OrderingPolicy};

/// Cycle state machine; every failure returns straight to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Connecting,
    Fetching,
    Diffing,
    Writing,
    Persisting,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub credential: Secret,
    pub base_endpoint: String,
    pub ordering: OrderingPolicy,
}

pub struct SyncEngine {
    settings: EngineSettings,
    fetcher: RecordFetcher,
    destination: Arc<dyn DestinationConnector>,
    known_ids: KnownIdStore,
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        fetcher: RecordFetcher,
        destination: Arc<dyn DestinationConnector>,
        known_ids: KnownIdStore,
    ) -> Self {
        Self {
            settings,
            fetcher,
            destination,
            known_ids,
        }
    }

    /// Wires the HTTP fetcher and the Google Sheets destination from config.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let fetcher = RecordFetcher::new(
            Arc::new(http),
            PaginationPolicy {
                page_delay: config.page_delay,
                max_pages: config.max_pages,
            },
        );
        let destination = SheetsConnector::new(
            config.credentials.load()?,
            config.require_spreadsheet_url()?,
            config.http_timeout,
        )?;

        Ok(Self::new(
            EngineSettings {
                credential: config.require_api_token()?.clone(),
                base_endpoint: config.base_url.clone(),
                ordering: config.ordering,
            },
            fetcher,
            Arc::new(destination),
            KnownIdStore::new(config.known_ids_path.clone()),
        ))
    }

    /// Runs one cycle to completion. Never fails: every error is folded
    /// into the returned outcome.
    pub async fn run_cycle(&self) -> SyncCycleResult {
        let span = info_span!("sync_cycle", ordering = %self.settings.ordering);
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> SyncCycleResult {
        let started_at = Local::now();

        enter(CyclePhase::Connecting);
        let mut writer = match self.destination.connect().await {
            Ok(writer) => writer,
            Err(err) => {
                let location = self.destination.location();
                error!(destination = %location, error = %err, "destination connection failed");
                return SyncCycleResult::aborted(
                    started_at,
                    CycleOutcome::ConnectionFailed(format!("{location}: {err}")),
                );
            }
        };

        let known = self.known_ids.load().await;
        debug!(known = known.len(), "loaded known ids");

        enter(CyclePhase::Fetching);
        let fetched = match self
            .fetcher
            .fetch_all(&self.settings.credential, &self.settings.base_endpoint)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "fetch returned nothing; leaving destination untouched");
                return SyncCycleResult::aborted(
                    started_at,
                    CycleOutcome::NoRecords {
                        reason: Some(err.to_string()),
                    },
                );
            }
        };
        if fetched.orders.is_empty() {
            info!(pages = fetched.pages_fetched, "upstream returned no orders; leaving destination untouched");
            let mut result = SyncCycleResult::aborted(started_at, CycleOutcome::NoRecords { reason: None });
            result.pages_fetched = fetched.pages_fetched;
            return result;
        }

        enter(CyclePhase::Diffing);
        let fetched_ids: KnownIds = fetched.orders.iter().map(|o| o.id).collect();
        let new_ids: HashSet<_> = fetched_ids.difference(&known).into_iter().collect();
        info!(total = fetched_ids.len(), new = new_ids.len(), "diffed against known ids");

        enter(CyclePhase::Writing);
        let rows = order_rows(normalize_all(&fetched.orders, Local::now()), self.settings.ordering);
        let new_orders: Vec<CanonicalRow> = rows
            .iter()
            .filter(|row| new_ids.contains(&row.id))
            .cloned()
            .collect();

        let mut result = SyncCycleResult {
            started_at,
            finished_at: started_at,
            new_count: new_ids.len(),
            total_count: rows.len(),
            success: false,
            outcome: CycleOutcome::Synced,
            pages_fetched: fetched.pages_fetched,
            truncated: fetched.truncated(),
            new_orders,
            breakdown: OrderBreakdown::from_rows(&rows),
        };

        if let Err(err) = write_snapshot(&mut *writer, &rows).await {
            error!(error = %err, "destination write failed; known ids left unchanged");
            result.outcome = CycleOutcome::WriteFailed(err.to_string());
            result.finished_at = Local::now();
            return result;
        }

        enter(CyclePhase::Persisting);
        if let Err(err) = self.known_ids.save(&fetched_ids).await {
            error!(error = %format!("{err:#}"), "saving known ids failed");
            result.outcome = CycleOutcome::PersistFailed(format!("{err:#}"));
            result.finished_at = Local::now();
            return result;
        }

        result.success = true;
        result.finished_at = Local::now();
        info!(total = result.total_count, new = result.new_count, "cycle complete");
        result
    }
}

fn enter(phase: CyclePhase) {
    debug!(?phase, "cycle phase");
}

/// Clear, then header at A1, then the data block at A2. Not transactional:
/// a failure after the clear leaves the grid partially written.
pub async fn write_snapshot(writer: &mut dyn GridWriter, rows: &[CanonicalRow]) -> Result<(), DestinationError> {
    writer.clear().await?;
    writer.write_rows(HEADER_ORIGIN, &[header_cells()]).await?;
    let data: Vec<_> = rows.iter().map(CanonicalRow::to_cells).collect();
    writer.write_rows(DATA_ORIGIN, &data).await
}
