//! forecast-forge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use forecast_forge::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get the logging options
    let cli = forecast_forge::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    init_logging(&cli.logging_options())?;

    forecast_forge::cli::run_with_cli(cli).await
}
