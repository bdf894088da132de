//! Fleet Rebalancer
//!
//! One-shot CLI: queries the scheduler, computes how many units the
//! busiest machine must shed, then redeploys each selected unit with a
//! fresh instance number and retires the old instance once the
//! replacement reports healthy. `--dry-run` reports the plan and exits
//! without mutating the scheduler or the store.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

use fleet_rebalancer::{Driver, HttpFleetClient, HttpRegistry, RebalancerConfig};

#[derive(Parser)]
#[command(name = "fleet-rebalancer")]
#[command(about = "Rebalances fleet units off the busiest machine")]
#[command(version)]
struct Cli {
    /// Scheduler host to send commands to, <hostname>:<port>
    #[arg(short = 'f', long, env = "FLEET_HOST", default_value = "localhost:49153")]
    fleet_host: String,

    /// Coordination store host, <hostname>:<port>
    #[arg(short = 'e', long, env = "REGISTRY_HOST", default_value = "localhost:4001")]
    registry_host: String,

    /// Machine ID to reschedule away from (default: derived busiest machine)
    #[arg(short = 'm', long)]
    machine_id: Option<String>,

    /// Readiness wait budget per unit in seconds
    #[arg(long, default_value = "600")]
    wait_budget: u64,

    /// Submission attempts per unit before giving up
    #[arg(long, default_value = "5")]
    submit_attempts: u32,

    /// Compute and report the plan without mutating anything
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Verbose output
    #[arg(short = 'v', long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let config = RebalancerConfig {
        fleet_host: cli.fleet_host,
        registry_host: cli.registry_host,
        machine_id: cli.machine_id,
        wait_budget_secs: cli.wait_budget,
        submit_attempts: cli.submit_attempts,
        dry_run: cli.dry_run,
    };

    info!(
        fleet_host = %config.fleet_host,
        registry_host = %config.registry_host,
        dry_run = config.dry_run,
        "Starting fleet rebalancing"
    );

    let fleet = match HttpFleetClient::new(&config.fleet_host) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Could not build scheduler client");
            return ExitCode::FAILURE;
        }
    };
    let registry = match HttpRegistry::new(&config.registry_host) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Could not build store client");
            return ExitCode::FAILURE;
        }
    };

    let driver = Driver::new(fleet, registry, config);

    match driver.run().await {
        Ok(summary) => {
            info!(summary = %summary.summary(), "Done");
            if summary.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "Rebalance run aborted");
            ExitCode::FAILURE
        }
    }
}
