//! Repeats sync cycles until shutdown. Cycles never overlap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ordersync_core::SyncCycleResult;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Sleep this long after each cycle finishes.
    Interval(Duration),
    /// Cron expression; a tick that lands while a cycle is running is skipped.
    Cron(String),
}

impl Schedule {
    pub fn from_config(config: &SyncConfig) -> Self {
        match &config.sync_cron {
            Some(expr) => Schedule::Cron(expr.clone()),
            None => Schedule::Interval(config.poll_interval),
        }
    }
}

/// Callback invoked with the 1-based cycle number after every cycle.
pub type CycleReporter = Arc<dyn Fn(u64, &SyncCycleResult) + Send + Sync>;

pub async fn run_scheduled<S>(
    engine: Arc<SyncEngine>,
    schedule: Schedule,
    shutdown: S,
    report: CycleReporter,
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    match schedule {
        Schedule::Interval(every) => run_interval(engine, every, shutdown, report).await,
        Schedule::Cron(expr) => run_cron(engine, &expr, shutdown, report).await,
    }
}

async fn run_interval<S>(
    engine: Arc<SyncEngine>,
    every: Duration,
    shutdown: S,
    report: CycleReporter,
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        let result = engine
            .run_cycle()
            .instrument(info_span!("scheduled", cycle))
            .await;
        report(cycle, &result);

        tokio::select! {
            _ = &mut shutdown => {
                info!(cycles = cycle, "scheduler stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(every) => {}
        }
    }
}

async fn run_cron<S>(
    engine: Arc<SyncEngine>,
    expr: &str,
    shutdown: S,
    report: CycleReporter,
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    let counter = Arc::new(Mutex::new(0u64));
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;

    let job = Job::new_async(expr, move |_uuid, _l| {
        let engine = engine.clone();
        let counter = counter.clone();
        let report = report.clone();
        Box::pin(async move {
            let Ok(mut cycle) = counter.try_lock() else {
                warn!("previous cycle still running; skipping tick");
                return;
            };
            *cycle += 1;
            let result = engine
                .run_cycle()
                .instrument(info_span!("scheduled", cycle = *cycle))
                .await;
            report(*cycle, &result);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {expr}"))?;

    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = expr, "scheduler started");

    shutdown.await;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expression_takes_precedence_over_interval() {
        let mut config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(Schedule::from_config(&config), Schedule::Interval(Duration::from_secs(300)));

        config.sync_cron = Some("0 */5 * * * *".into());
        assert_eq!(Schedule::from_config(&config), Schedule::Cron("0 */5 * * * *".into()));
    }
}
