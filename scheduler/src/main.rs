// Scheduler binary entry point: refresh daemon and one-shot audit

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::audit::run_audit;
use common::bootstrap;
use common::config::Settings;
use common::persistence::CronDirectory;
use common::scheduler::{RefreshConfig, RefreshEngine, Scheduler};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

const SERVICE_NAME: &str = "scan-scheduler";

#[derive(Parser, Debug)]
#[command(
    name = "scheduler",
    about = "Turns catalog schedule tags and group policies into cron triggers",
    version
)]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, short = 'c', global = true, env = "SCHEDULER_CONFIG", default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Refresh trigger files periodically until stopped (default)
    Daemon,
    /// Resolve the catalog once and print a CSV report to stdout
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = bootstrap::load_settings(&cli.config)?;
    bootstrap::init_observability(SERVICE_NAME, &settings)?;

    let result = match cli.command.unwrap_or(Command::Daemon) {
        Command::Daemon => daemon(settings).await,
        Command::Audit => audit(settings).await,
    };

    telemetry::shutdown_tracer();
    result
}

async fn daemon(settings: Settings) -> Result<()> {
    info!(cron_dir = %settings.cron.directory.display(), "Starting scan scheduler daemon");

    let client = bootstrap::init_catalog_client(&settings, SERVICE_NAME)?;
    let policies = bootstrap::init_policies(&settings);
    let store = CronDirectory::new(&settings.cron);

    let engine = Arc::new(RefreshEngine::new(
        RefreshConfig::from_settings(&settings),
        client,
        policies,
        store,
    ));

    let engine_for_shutdown = Arc::clone(&engine);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping after the current pass");
        engine_for_shutdown.stop().await;
    });

    engine
        .start()
        .await
        .context("Failed to purge stale trigger files")?;

    info!("Scheduler stopped");
    Ok(())
}

async fn audit(settings: Settings) -> Result<()> {
    let client = bootstrap::init_catalog_client(&settings, SERVICE_NAME)?;
    let policies = bootstrap::init_policies(&settings);

    let report = run_audit(
        client.as_ref(),
        &policies,
        settings.catalog.page_size,
        Utc::now(),
    )
    .await
    .context("Audit could not read the catalog")?;

    report
        .write_csv(std::io::stdout().lock())
        .context("Failed to write audit report")?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!(error = %e, "Failed to listen for Ctrl+C");
                        }
                    }
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
