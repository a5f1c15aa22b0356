//! fanjoin - order-preserving parallel command runner

use anyhow::{Context, Result};
use clap::Parser;
use fanjoin::cli::{self, Cli};
use fanjoin::{JoinError, logging, orchestrator};
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::info;

/// Program entry point: parses arguments, runs the pool and exits with the
/// aggregated status.
///
/// Usage errors exit 2 (clap), internal failures exit 1 after printing the
/// error chain, and a failing worker's status is passed through unchanged.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    if let Some(shell) = cli.completions {
        cli::print_completions(shell);
        return;
    }

    logging::init(cli.log_config());

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            let code = e
                .downcast_ref::<JoinError>()
                .map(JoinError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

/// Run the configured command and return the exit code to report.
fn run(cli: &Cli) -> Result<i32> {
    let config = cli.join_config().context("No command given")?;

    let report = orchestrator::run(&config)?;
    if let Some(failed) = report.first_failure() {
        info!(
            worker = failed.index,
            reason = %failed.reason,
            "Reporting exit status of first failing worker"
        );
    }
    Ok(report.exit_code())
}
