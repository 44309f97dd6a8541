//! SQLite persistent storage.
//!
//! This module provides the storage gateway used for run tracking, cleaned
//! input data and forecast results.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: connection pool with bounded connection retry, transactional
//!   scopes and chunked bulk inserts. A gateway configured with zero
//!   connection attempts is disabled and every write becomes a no-op.
//! - **ReadRetry**: fixed-sleep retry policy applied at the call site of
//!   read-only queries.
//! - **Migrations**: schema management and versioning.
//!
//! # Usage
//!
//! ```rust,ignore
//! use forecast_forge::pipeline::DatabaseConfig;
//! use forecast_forge::storage::Database;
//!
//! let db = Database::connect(&DatabaseConfig::sqlite_file("forecast.db")).await?;
//! db.run_migrations().await?;
//!
//! // Each chunk of 10_000 rows commits on its own
//! db.bulk_insert(&cleaned_rows).await?;
//!
//! // Reads are retried on BUSY/LOCKED and pool timeouts
//! let pool = db.require_pool("count runs")?;
//! let (runs,): (i64,) = db
//!     .read_retry()
//!     .run("count_runs", || sqlx::query_as("SELECT COUNT(*) FROM forecast_run").fetch_one(pool))
//!     .await?;
//! ```

pub mod database;
pub mod migrations;
pub mod retry;
pub mod schema;

// Re-export main types for convenience
pub use database::{BulkRow, Database, DatabaseError, TableStatus, TransactionScope};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use retry::{ReadRetry, Transient};
