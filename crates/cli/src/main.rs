//! Specgrid CLI - Main Entry Point
//!
//! `specgrid build <run-id>` prepares a test run; `specgrid run <run-id>`
//! works through its specs. Both exit non-zero on any unrecovered error.

use clap::{Parser, Subcommand};
use specgrid_common::{AppContext, ErrorKind, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{build, run};

const KEEPALIVE: Duration = Duration::from_secs(3600);

/// Specgrid - distributed Cypress/Playwright spec runner
#[derive(Parser)]
#[command(name = "specgrid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file; missing is fine, defaults and SPECGRID_* apply
    #[arg(long, global = true, env = "SPECGRID_CONFIG", default_value = "/etc/specgrid/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Sleep for an hour before exiting on failure, for postmortem access
    #[arg(long, global = true)]
    keepalive_on_failure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, install, discover specs, build and publish a test run
    Build(build::BuildArgs),

    /// Claim and run specs for a test run until none are left
    Run(run::RunArgs),
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);
    info!("Specgrid v{}", specgrid_common::VERSION);

    let mut settings = match Settings::load(Some(cli.config.as_path())) {
        Ok(s) => s,
        Err(e) => {
            error!("Could not load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    settings.keepalive_on_failure |= cli.keepalive_on_failure;
    let keepalive = settings.keepalive_on_failure;
    let ctx = AppContext::new(settings);

    let result = match cli.command {
        Commands::Build(args) => build::execute(args, ctx).await,
        Commands::Run(args) => run::execute(args, ctx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let cancelled = e
                .downcast_ref::<specgrid_common::Error>()
                .is_some_and(|e| e.kind() == ErrorKind::Cancelled);
            if cancelled {
                warn!("{:#}", e);
                return ExitCode::FAILURE;
            }
            error!("{:#}", e);
            if keepalive {
                warn!("keepalive_on_failure is set, sleeping for {:?}", KEEPALIVE);
                tokio::time::sleep(KEEPALIVE).await;
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["specgrid", "run", "42", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.run_id, 42),
            Commands::Build(_) => panic!("parsed as build"),
        }
    }

    #[test]
    fn test_run_id_required() {
        assert!(Cli::try_parse_from(["specgrid", "build"]).is_err());
    }
}
