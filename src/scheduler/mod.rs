//! Unit execution: sequentially in the caller or across isolated workers.
//!
//! This module provides the infrastructure that runs the units of one run:
//!
//! - **ExecutionEngine**: chooses the sequential path or the worker pool and
//!   reports every unit's outcome in submission order
//! - **Worker / WorkerFactory**: isolated executors, either tasks of the
//!   current process or re-executed worker processes
//! - **UnitJob**: plain data describing one unit and the arguments shared by
//!   the whole run
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ units + shared args
//!                      ┌──────▼───────┐
//!                      │  Execution   │
//!                      │   Engine     │
//!                      └──────┬───────┘
//!                             │ shared queue
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───── JSON log lines on stderr ────────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │   LogRelay   │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use forecast_forge::scheduler::{ExecutionEngine, LocalWorkerFactory};
//! use std::sync::Arc;
//!
//! let engine = ExecutionEngine::new(entry, Arc::new(LocalWorkerFactory::new(builder)));
//! engine.execute(&config.units, config.parallelism, shared_args).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Failure isolation**: a failing unit never stops its siblings
//! - **Crash recovery**: a dead worker is replaced before the slot's next unit
//! - **Interruption**: dropping the engine future kills outstanding worker processes

pub mod job;
pub mod process;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{FailureKind, SharedArgs, UnitFailure, UnitJob, WorkerReply, WorkerRequest};
pub use process::{
    worker_main, LogRelay, ProcessWorker, ProcessWorkerFactory, RelayedEvent, WorkerExit,
    INTERRUPTED_EXIT_CODE, WORKER_ID_ENV, WORKER_SUBCOMMAND,
};
pub use worker_pool::{
    EntryBuilder, ExecutionEngine, ExecutionReport, LocalWorker, LocalWorkerFactory, PoolError,
    PoolStats, UnitEntry, UnitOutcome, Worker, WorkerFactory,
};
