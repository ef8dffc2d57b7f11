use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ordersync_core::SyncCycleResult;
use ordersync_storage::KnownIdStore;
use ordersync_sync::{run_scheduled, CycleReporter, LogFormat, Schedule, SyncConfig, SyncEngine};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod report;

#[derive(Debug, Parser)]
#[command(name = "ordersync")]
#[command(about = "Mirror tracker orders into a Google Sheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single cycle and exit.
    Sync,
    /// Poll until interrupted.
    Run,
    /// Show the known-id store and destination without syncing.
    Status,
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received; finishing"),
        Err(err) => {
            warn!(error = %err, "cannot listen for interrupts; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    init_logging(config.log_format);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = SyncEngine::from_config(&config)?;
            let result = engine.run_cycle().await;
            print!("{}", report::render_cycle(1, &result));
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Run => {
            let engine = Arc::new(SyncEngine::from_config(&config)?);
            let schedule = Schedule::from_config(&config);
            info!(?schedule, ordering = %config.ordering, "starting order sync");
            let reporter: CycleReporter = Arc::new(|cycle: u64, result: &SyncCycleResult| {
                print!("{}", report::render_cycle(cycle, result));
            });
            run_scheduled(engine, schedule, shutdown_signal(), reporter).await?;
        }
        Commands::Status => {
            let store = KnownIdStore::new(config.known_ids_path.clone());
            let known = store.load().await;
            println!("known ids: {} ({})", known.len(), store.path().display());
            println!(
                "spreadsheet: {}",
                config.spreadsheet_url.as_deref().unwrap_or("not configured")
            );
            println!("upstream: {}", config.base_url);
            println!(
                "api token: {}",
                if config.api_token.is_some() { "set" } else { "not set" }
            );
            println!("schedule: {:?}", Schedule::from_config(&config));
        }
    }

    Ok(ExitCode::SUCCESS)
}
