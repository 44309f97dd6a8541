//! Error types for forecast-forge operations.
//!
//! Each subsystem owns its error enum (`DatabaseError` in storage, `ConfigError`
//! in pipeline configuration, `PoolError` in the scheduler). This module holds
//! the data-level errors raised by collaborators and the crate-wide
//! `ForecastError` that the orchestrator maps onto terminal run statuses.

use thiserror::Error;

use crate::pipeline::ConfigError;
use crate::scheduler::{PoolError, UnitFailure};
use crate::storage::DatabaseError;

/// Errors raised while loading, validating or transforming account data.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Account data empty for unit '{unit}'")]
    EmptyData { unit: String },

    #[error("Raw input is empty")]
    EmptyInput,

    #[error("Exogenous feature input is empty")]
    EmptyExogenousInput,

    #[error("Invalid input at row {row}: {message}")]
    InvalidRecord { row: usize, message: String },

    #[error("Missing input file: {0}")]
    MissingInput(String),

    #[error(
        "Cannot determine valid cleaning data: {0}. Re-run with --force-reload to import fresh data"
    )]
    NoValidCleaning(String),

    #[error("No cleaned data found for run {0}")]
    NoCleanedData(i64),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// A unit failed inside a worker process; only its serialized summary crossed back.
    #[error("{0}")]
    UnitFailed(UnitFailure),

    #[error("Worker crashed while running unit '{unit}': {message}")]
    WorkerCrashed { unit: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForecastError {
    /// Returns true for cooperative interruption, which maps to CANCELLED rather than FAILED.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForecastError::Cancelled)
    }
}

impl From<csv::Error> for ForecastError {
    fn from(err: csv::Error) -> Self {
        ForecastError::Data(DataError::Csv(err))
    }
}
