//! Command-line interface for forecast-forge.
//!
//! Provides the run subcommands, database setup and inspection, and the
//! hidden entry point of worker processes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, InfoArgs, RunArgs};
