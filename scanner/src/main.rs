// Scanner binary: fired by cron, submits one scheduled scan through the gate

use anyhow::{Context, Result};
use clap::Parser;
use common::bootstrap;
use common::catalog::CatalogClient;
use common::gate::{GateOutcome, ScanGate};
use common::scan::{ScanRequest, ScanService};
use common::tag::normalize_engines;
use common::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const SERVICE_NAME: &str = "scan-trigger";

/// Another invocation holds the gate for this project branch
const EXIT_BUSY: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "scanner",
    about = "Submit a scheduled scan unless one is already queued or running",
    version
)]
struct Cli {
    /// Catalog project id
    #[arg(long = "projectid", short = 'p')]
    project_id: String,

    /// Branch to scan
    #[arg(long, short = 'b')]
    branch: String,

    /// Repository clone URL
    #[arg(long, short = 'r')]
    repo: String,

    /// Engine to run; repeat for several
    #[arg(long = "engine", short = 'e', required = true)]
    engines: Vec<String>,

    /// Schedule that fired this scan, recorded on the scan tag
    #[arg(long, short = 's')]
    schedule: Option<String>,

    /// Directory holding default.toml and local.toml
    #[arg(long, short = 'c', env = "SCHEDULER_CONFIG", default_value = "config")]
    config: String,
}

impl Cli {
    fn request(&self) -> ScanRequest {
        ScanRequest {
            project_id: self.project_id.clone(),
            branch: self.branch.clone(),
            repo_url: self.repo.clone(),
            engines: normalize_engines(&self.engines.join(",")),
            schedule: self.schedule.clone(),
        }
    }
}

fn exit_code(outcome: &Result<GateOutcome>) -> ExitCode {
    match outcome {
        Ok(GateOutcome::Submitted { .. }) | Ok(GateOutcome::AlreadyRunning) => ExitCode::SUCCESS,
        Ok(GateOutcome::Busy) => ExitCode::from(EXIT_BUSY),
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run(cli: &Cli) -> Result<GateOutcome> {
    let settings = bootstrap::load_settings(&cli.config)?;
    bootstrap::init_observability(SERVICE_NAME, &settings)?;

    let client = bootstrap::init_catalog_client(&settings, SERVICE_NAME)?;
    let lock = bootstrap::init_gate_lock(&settings).await?;
    let catalog: Arc<dyn CatalogClient> = client.clone();
    let scans: Arc<dyn ScanService> = client;

    let gate = ScanGate::new(lock, catalog, scans);
    let outcome = gate
        .submit_if_idle(&cli.request())
        .await
        .with_context(|| format!("Scan gate failed for project {}", cli.project_id))?;

    telemetry::record_gate_outcome(outcome.as_str());
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = run(&cli).await;

    match &outcome {
        Ok(outcome) => info!(
            project_id = %cli.project_id,
            branch = %cli.branch,
            outcome = outcome.as_str(),
            "Scanner finished"
        ),
        Err(e) => {
            error!(project_id = %cli.project_id, error = %format!("{:#}", e), "Scanner failed");
            // Logging may not be up if configuration failed to load
            eprintln!("scanner: {:#}", e);
        }
    }

    telemetry::shutdown_tracer();
    exit_code(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_engines_are_normalized() {
        let cli = Cli::parse_from([
            "scanner", "-p", "p1", "-b", "main", "-r", "https://git/app.git", "-e", "SAST", "-e",
            "kics", "-e", "bogus", "-s", "0 2 * * *",
        ]);
        let request = cli.request();
        assert_eq!(request.project_id, "p1");
        assert_eq!(
            request.engines.into_iter().collect::<Vec<_>>(),
            vec!["kics".to_string(), "sast".to_string()]
        );
        assert_eq!(request.schedule.as_deref(), Some("0 2 * * *"));
    }

    #[test]
    fn test_engine_is_required() {
        let result = Cli::try_parse_from(["scanner", "-p", "p1", "-b", "main", "-r", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            exit_code(&Ok(GateOutcome::Submitted { scan_id: None })),
            ExitCode::SUCCESS
        );
        assert_eq!(exit_code(&Ok(GateOutcome::AlreadyRunning)), ExitCode::SUCCESS);
        assert_eq!(exit_code(&Ok(GateOutcome::Busy)), ExitCode::from(EXIT_BUSY));
        assert_eq!(exit_code(&Err(anyhow::anyhow!("boom"))), ExitCode::FAILURE);
    }
}
