//! forecast-forge: supervised batch runs of per-account demand forecasts.
//!
//! This library imports and cleans order history, runs one forecast pipeline
//! per configured account, either sequentially or in a pool of worker
//! processes, and records the status of every run and unit in SQLite.

// Core modules
pub mod cli;
pub mod data;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod runs;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{DataError, ForecastError};
