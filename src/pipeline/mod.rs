//! Run orchestration for per-account forecasts.
//!
//! This module provides the pipeline infrastructure that turns one
//! invocation into a tracked run: configuration, global preprocessing, and
//! the per-unit forecast stages.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Config**: installation-wide `EngineConfig` and the per-invocation `RunConfig`
//! - **Orchestrator**: drives the run through its statuses and global preprocessing
//! - **Runner**: runs one unit's `UnitPipeline` under unit-run status tracking
//! - **Context**: per-process storage gateway and collaborators
//!
//! # Pipeline Flow
//!
//! 1. **Initialization**: the run is recorded as INITIALIZED
//! 2. **Preprocessing**: raw input is imported, validated and cleaned, or a
//!    previous cleaning run is selected; stored forecasts get their actuals
//! 3. **Model runs**: every unit is loaded, preprocessed, trained, forecast,
//!    post-processed and stored, sequentially or in worker processes
//! 4. **Completion**: the run ends COMPLETED, FAILED or CANCELLED
//!
//! # Example
//!
//! ```rust,ignore
//! use forecast_forge::pipeline::{
//!     BaselineProvider, EngineConfig, EngineRunType, Orchestrator, RunConfig, RunParameters,
//!     UnitRunnerBuilder,
//! };
//! use forecast_forge::scheduler::LocalWorkerFactory;
//! use std::sync::Arc;
//!
//! let engine = EngineConfig::load(None)?;
//! let config = Arc::new(RunConfig::new(&engine, RunParameters::new(EngineRunType::Development))?);
//!
//! let provider = Arc::new(BaselineProvider);
//! let workers = Arc::new(LocalWorkerFactory::new(Arc::new(UnitRunnerBuilder::new(provider.clone()))));
//! let mut orchestrator = Orchestrator::from_config(config, workers, provider).await?;
//! orchestrator.run().await?;
//! ```

pub mod config;
pub mod context;
pub mod orchestrator;
pub mod run_config;
pub mod runner;

// Re-export main types for convenience
pub use config::{ConfigError, DatabaseConfig, EngineConfig, UnitConfig, WorkerMode};
pub use context::{UnitRunnerBuilder, WorkerContext};
pub use orchestrator::Orchestrator;
pub use run_config::{
    format_month, month_from_key, month_key, month_start, parse_month, shift_months,
    EngineRunType, RunConfig, RunParameters, PREDICTION_MONTH_FORMAT,
};
pub use runner::{
    BaselineProvider, MovingAveragePipeline, PipelineProvider, UnitPipeline, UnitRunner,
};
