//! SQLite storage gateway.
//!
//! `Database` wraps an optional connection pool. A gateway configured with
//! zero connection attempts is permanently disabled: it never connects, write
//! helpers skip themselves, and callers take their file-based fallback paths.
//! An enabled gateway connects with a bounded number of attempts, hands out
//! transactional scopes, and performs chunked bulk inserts in which every chunk
//! commits on its own.

use std::str::FromStr;

use sqlx::query_builder::Separated;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pipeline::DatabaseConfig;

use super::migrations::MigrationRunner;
use super::retry::{ReadRetry, Transient};
use super::schema::tables;

/// SQLite's upper bound on bound parameters in one statement.
const MAX_BIND_PARAMETERS: usize = 32_766;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed after all attempts.
    #[error("Connection failed after {attempts} attempt(s): {message}")]
    ConnectionFailed { attempts: u32, message: String },

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The operation needs a live connection but the database is disabled.
    #[error("Database is disabled, cannot {0}")]
    Disabled(String),
}

impl Transient for DatabaseError {
    fn is_transient(&self) -> bool {
        match self {
            DatabaseError::QueryFailed(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Pool timeouts, I/O failures and SQLite BUSY/LOCKED are worth retrying.
impl Transient for sqlx::Error {
    fn is_transient(&self) -> bool {
        match self {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// A row type that can be written with [`Database::bulk_insert`].
pub trait BulkRow: Send + Sync {
    /// Destination table.
    const TABLE: &'static str;
    /// Column names, in the order [`BulkRow::push_bindings`] binds them.
    const COLUMNS: &'static [&'static str];

    /// Binds this row's values to one `VALUES` tuple.
    fn push_bindings(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>);
}

/// A transaction that commits or rolls back depending on the result it finishes with.
///
/// The connection returns to the pool when the scope is dropped, whichever
/// way it ends.
pub struct TransactionScope {
    tx: Transaction<'static, Sqlite>,
}

impl TransactionScope {
    /// Connection to run statements on inside this scope.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Commits on `Ok`, rolls back on `Err` and returns the original error.
    pub async fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<DatabaseError> + std::fmt::Display,
    {
        match result {
            Ok(value) => {
                self.tx
                    .commit()
                    .await
                    .map_err(|e| E::from(DatabaseError::QueryFailed(e)))?;
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "Rolling back transaction");
                if let Err(rollback) = self.tx.rollback().await {
                    error!(error = %rollback, "Transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Row count of one table, as reported by [`Database::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    pub table: String,
    pub rows: i64,
}

/// SQLite storage gateway.
pub struct Database {
    pool: Option<SqlitePool>,
    config: DatabaseConfig,
}

impl Database {
    /// Connects to the database, retrying with a fixed sleep between attempts.
    ///
    /// With zero configured attempts this returns a disabled gateway without
    /// trying to connect.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::ConnectionFailed` when every attempt fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if config.is_disabled() {
            info!("Database disabled by configuration, running without durable storage");
            return Ok(Self::disabled(config.clone()));
        }

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DatabaseError::ConnectionFailed {
                attempts: 0,
                message: format!("invalid database url '{}': {}", config.url, e),
            })?
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.connection_timeout());

        let attempts = config.connection_attempts;
        let mut attempt = 1;
        loop {
            let result = SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.connection_timeout())
                .connect_with(options.clone())
                .await;

            match result {
                Ok(pool) => {
                    debug!(url = %config.url, attempt, "Connected to database");
                    return Ok(Self {
                        pool: Some(pool),
                        config: config.clone(),
                    });
                }
                Err(e) if attempt >= attempts => {
                    error!(url = %config.url, attempt, error = %e, "Database connection failed");
                    return Err(DatabaseError::ConnectionFailed {
                        attempts,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        url = %config.url,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Database connection attempt failed, retrying"
                    );
                    tokio::time::sleep(config.retry_sleep()).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Creates a gateway that never connects.
    pub fn disabled(config: DatabaseConfig) -> Self {
        Self { pool: None, config }
    }

    /// Creates a gateway from an existing pool.
    pub fn from_pool(pool: SqlitePool, config: DatabaseConfig) -> Self {
        Self {
            pool: Some(pool),
            config,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.pool.is_none()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the pool, or `None` when the gateway is disabled.
    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    /// Returns the pool or a `Disabled` error naming the attempted operation.
    pub fn require_pool(&self, operation: &str) -> Result<&SqlitePool, DatabaseError> {
        self.pool
            .as_ref()
            .ok_or_else(|| DatabaseError::Disabled(operation.to_string()))
    }

    /// Read retry policy from this gateway's configuration.
    pub fn read_retry(&self) -> ReadRetry {
        ReadRetry::new(self.config.read_retries, self.config.read_retry_sleep())
    }

    /// Opens a transactional scope.
    pub async fn begin(&self) -> Result<TransactionScope, DatabaseError> {
        let pool = self.require_pool("open a transaction")?;
        let tx = pool.begin().await?;
        Ok(TransactionScope { tx })
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let pool = self.require_pool("run migrations")?;
        let runner = MigrationRunner::new(pool.clone());
        Ok(runner.run_migrations().await?)
    }

    /// Inserts rows in chunks, each chunk committed in its own transaction.
    ///
    /// The chunk size is the configured `bulk_chunk_size`, or the row count
    /// when smaller. A failing chunk is rolled back and its error returned;
    /// earlier chunks stay committed and later ones are not attempted.
    /// Returns the number of rows inserted, which is zero when the gateway is
    /// disabled.
    pub async fn bulk_insert<R: BulkRow>(&self, rows: &[R]) -> Result<usize, DatabaseError> {
        if self.is_disabled() {
            debug!(table = R::TABLE, rows = rows.len(), "Database disabled, skipping bulk insert");
            return Ok(0);
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let chunk_size = self.config.bulk_chunk_size.min(rows.len()).max(1);
        let rows_per_statement = (MAX_BIND_PARAMETERS / R::COLUMNS.len().max(1)).max(1);
        let chunk_count = rows.len().div_ceil(chunk_size);
        let mut inserted = 0;

        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            let mut scope = self.begin().await?;
            let result = async {
                for batch in chunk.chunks(rows_per_statement) {
                    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                        "INSERT INTO {} ({}) ",
                        R::TABLE,
                        R::COLUMNS.join(", ")
                    ));
                    builder.push_values(batch, |mut row, value| value.push_bindings(&mut row));
                    builder.build().execute(scope.conn()).await?;
                }
                Ok::<usize, DatabaseError>(chunk.len())
            }
            .await;

            match scope.finish(result).await {
                Ok(count) => {
                    inserted += count;
                    debug!(
                        table = R::TABLE,
                        chunk = index + 1,
                        chunks = chunk_count,
                        rows = count,
                        "Committed bulk insert chunk"
                    );
                }
                Err(e) => {
                    error!(
                        table = R::TABLE,
                        chunk = index + 1,
                        chunks = chunk_count,
                        committed_rows = inserted,
                        error = %e,
                        "Bulk insert chunk failed"
                    );
                    return Err(e);
                }
            }
        }

        info!(table = R::TABLE, rows = inserted, chunks = chunk_count, "Bulk insert complete");
        Ok(inserted)
    }

    /// Returns the row counts of all schema tables.
    pub async fn status(&self) -> Result<Vec<TableStatus>, DatabaseError> {
        let pool = self.require_pool("read status")?;
        let mut status = Vec::with_capacity(tables::ALL.len());
        for table in tables::ALL {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            let (rows,): (i64,) = self
                .read_retry()
                .run("table_row_count", || sqlx::query_as(&sql).fetch_one(pool))
                .await?;
            status.push(TableStatus {
                table: table.to_string(),
                rows,
            });
        }
        Ok(status)
    }

    /// Logs connection details and table row counts.
    pub async fn log_status(&self) -> Result<(), DatabaseError> {
        if self.is_disabled() {
            info!("Database is disabled");
            return Ok(());
        }
        info!(url = %self.config.url, "Database connection established");
        for entry in self.status().await? {
            info!(table = %entry.table, rows = entry.rows, "Table status");
        }
        Ok(())
    }

    /// Closes the pool, waiting for connections to be returned.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}
