//! CLI command definitions for forecast-forge.
//!
//! This module provides the command-line interface that starts forecast
//! runs, prepares the database and inspects stored runs.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::logging::LoggingOptions;
use crate::pipeline::{
    format_month, parse_month, BaselineProvider, EngineConfig, EngineRunType, Orchestrator,
    PipelineProvider, RunConfig, RunParameters, UnitRunnerBuilder, WorkerMode,
};
use crate::runs::RunStore;
use crate::scheduler::{
    worker_main, LocalWorkerFactory, LogRelay, ProcessWorkerFactory, WorkerExit, WorkerFactory,
};
use crate::storage::Database;

/// Default number of runs listed by `info`.
const DEFAULT_INFO_LIMIT: i64 = 10;

/// Supervised batch runs of per-account demand forecasts.
#[derive(Parser, Debug)]
#[command(name = "forecast-forge")]
#[command(about = "Run per-account demand forecasts with durable status tracking")]
#[command(version)]
#[command(
    long_about = "forecast-forge imports and cleans order history, forecasts every configured account and records the progress of each run and unit in SQLite.\n\nExample usage:\n  forecast-forge --config forecast.yaml development --forecast-periods 12\n  forecast-forge backward --prediction-month 202003 --only-unit Account_1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "FORECAST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Logging setup for this invocation.
    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions::new(self.log_level.clone())
            .with_file(self.log_file.clone())
            .for_worker(matches!(self.command, Commands::Worker))
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Forecast forward and store results in files and the internal tables.
    #[command(alias = "dev")]
    Development(RunArgs),

    /// Forecast forward and additionally export results for downstream use.
    #[command(alias = "prod")]
    Production(RunArgs),

    /// Backtest over past months; results are stored as files only.
    Backward(RunArgs),

    /// Apply the database schema.
    SetupDatabase,

    /// Show database status and the latest runs.
    Info(InfoArgs),

    /// Worker process entry point.
    #[command(hide = true)]
    Worker,
}

/// Options shared by the run subcommands.
#[derive(Parser, Debug, Clone, Default)]
pub struct RunArgs {
    /// Number of months to forecast.
    #[arg(long)]
    pub forecast_periods: Option<u32>,

    /// First forecast month (last one for backward runs), as YYYYMM.
    #[arg(long, value_parser = parse_month)]
    pub prediction_month: Option<NaiveDate>,

    /// Directory receiving the run's result folder.
    #[arg(short, long)]
    pub output_location: Option<PathBuf>,

    /// Run only this unit.
    #[arg(long, conflicts_with = "exclude_unit")]
    pub only_unit: Option<String>,

    /// Run every unit except this one.
    #[arg(long)]
    pub exclude_unit: Option<String>,

    /// Import and clean raw input even for backward runs.
    #[arg(long)]
    pub force_reload: bool,

    /// Maximum number of units run in parallel.
    #[arg(short, long)]
    pub parallelism: Option<usize>,
}

impl RunArgs {
    /// Converts the options into run parameters.
    pub fn into_parameters(self, run_type: EngineRunType) -> RunParameters {
        RunParameters {
            run_type,
            forecast_periods: self.forecast_periods,
            prediction_month: self.prediction_month,
            output_location: self.output_location,
            only_unit: self.only_unit,
            exclude_unit: self.exclude_unit,
            force_reload: self.force_reload,
            parallelism: self.parallelism,
        }
    }
}

/// Arguments for `forecast-forge info`.
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Number of latest runs to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_INFO_LIMIT)]
    pub limit: i64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to set up logging before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Development(args) => {
            run_forecast_command(cli.config, cli.log_level, EngineRunType::Development, args)
                .await
        }
        Commands::Production(args) => {
            run_forecast_command(cli.config, cli.log_level, EngineRunType::Production, args).await
        }
        Commands::Backward(args) => {
            run_forecast_command(cli.config, cli.log_level, EngineRunType::Backward, args).await
        }
        Commands::SetupDatabase => run_setup_database_command(cli.config).await,
        Commands::Info(args) => run_info_command(cli.config, args).await,
        Commands::Worker => run_worker_command().await,
    }
}

// ============================================================================
// Forecast Runs
// ============================================================================

async fn run_forecast_command(
    config_path: Option<PathBuf>,
    log_level: String,
    run_type: EngineRunType,
    args: RunArgs,
) -> anyhow::Result<()> {
    let engine = EngineConfig::load(config_path.as_deref())?;
    let config = Arc::new(RunConfig::new(&engine, args.into_parameters(run_type))?);
    info!(
        run_type = %config.run_type,
        prediction_month = %format_month(config.prediction_month),
        forecast_periods = config.forecast_periods,
        units = config.units.len(),
        parallelism = config.parallelism,
        output = %config.output_dir.display(),
        "Starting forecast run"
    );

    let provider: Arc<dyn PipelineProvider> = Arc::new(BaselineProvider);
    let workers: Arc<dyn WorkerFactory> = match config.worker_mode {
        WorkerMode::Process => {
            let (relay, _relay_task) = LogRelay::start();
            Arc::new(ProcessWorkerFactory::current_exe(
                vec!["--log-level".to_string(), log_level],
                relay,
            )?)
        }
        WorkerMode::Local => Arc::new(LocalWorkerFactory::new(Arc::new(
            UnitRunnerBuilder::new(Arc::clone(&provider)),
        ))),
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            // Ignore send error - the run may already be finished
            let _ = shutdown_tx.send(());
        }
    });

    let mut orchestrator = Orchestrator::from_config(Arc::clone(&config), workers, provider)
        .await?
        .with_shutdown(shutdown_rx);
    orchestrator.run().await?;

    let stats = orchestrator.engine_stats();
    info!(
        run_id = ?orchestrator.current_run().id,
        units_completed = stats.units_completed,
        success_rate = format!("{:.1}%", stats.success_rate()),
        output = %config.output_dir.display(),
        "Forecast run finished"
    );
    Ok(())
}

// ============================================================================
// Database Commands
// ============================================================================

async fn run_setup_database_command(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = EngineConfig::load(config_path.as_deref())?;
    let database = Database::connect(&engine.database).await?;
    if database.is_disabled() {
        warn!("Database is disabled by configuration, nothing to set up");
        return Ok(());
    }

    let applied = database.run_migrations().await?;
    info!(applied, url = %engine.database.url, "Database schema is up to date");
    database.log_status().await?;
    database.close().await;
    Ok(())
}

async fn run_info_command(config_path: Option<PathBuf>, args: InfoArgs) -> anyhow::Result<()> {
    let engine = EngineConfig::load(config_path.as_deref())?;
    let database = Arc::new(Database::connect(&engine.database).await?);
    database.log_status().await?;
    if database.is_disabled() {
        return Ok(());
    }

    let store = RunStore::new(Arc::clone(&database));
    for run in store.list_runs(args.limit).await? {
        info!(
            run_id = ?run.id,
            run_type = %run.run_type,
            status = %run.status,
            prediction_start_month = %format_month(run.prediction_start_month),
            start = %run.start,
            end = ?run.end,
            "Run"
        );
        if let Some(run_id) = run.id {
            for unit_run in store.unit_runs_for(run_id).await? {
                info!(
                    run_id,
                    unit = %unit_run.unit,
                    status = %unit_run.status,
                    end = ?unit_run.end,
                    "Unit run"
                );
            }
        }
    }
    database.close().await;
    Ok(())
}

// ============================================================================
// Worker Process
// ============================================================================

async fn run_worker_command() -> anyhow::Result<()> {
    let builder = Arc::new(UnitRunnerBuilder::new(Arc::new(BaselineProvider)));
    match worker_main(builder).await? {
        WorkerExit::Finished => Ok(()),
        interrupted @ WorkerExit::Interrupted => std::process::exit(interrupted.exit_code()),
    }
}
