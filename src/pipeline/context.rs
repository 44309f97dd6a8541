//! Per-worker resources.
//!
//! A `WorkerContext` owns one storage gateway and the collaborators built on
//! it. The parent process creates one for the orchestrator; every worker
//! builds its own, once, from the plain run configuration it receives.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::data::{DataLoader, DataOutput, Reconciler};
use crate::error::ForecastError;
use crate::runs::RunStore;
use crate::scheduler::{EntryBuilder, UnitEntry};
use crate::storage::Database;

use super::run_config::RunConfig;
use super::runner::{PipelineProvider, UnitRunner};

/// Storage gateway and collaborators owned by one process or worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<RunConfig>,
    pub database: Arc<Database>,
    pub store: RunStore,
    pub loader: DataLoader,
    pub output: DataOutput,
    pub reconciler: Reconciler,
}

impl WorkerContext {
    /// Connects to storage with the run's retry policy and builds the collaborators.
    pub async fn connect(config: Arc<RunConfig>) -> Result<Self, ForecastError> {
        let database = Arc::new(Database::connect(&config.database).await?);
        Ok(Self::with_database(config, database))
    }

    /// Builds the collaborators on an existing gateway.
    pub fn with_database(config: Arc<RunConfig>, database: Arc<Database>) -> Self {
        Self {
            store: RunStore::new(Arc::clone(&database)),
            loader: DataLoader::new(Arc::clone(&database), config.data_location.clone()),
            output: DataOutput::new(Arc::clone(&config), Arc::clone(&database)),
            reconciler: Reconciler::new(Arc::clone(&database)),
            config,
            database,
        }
    }

    /// Unit runner backed by this context.
    pub fn unit_runner(&self, provider: Arc<dyn PipelineProvider>) -> UnitRunner {
        UnitRunner::new(
            Arc::clone(&self.config),
            self.store.clone(),
            self.loader.clone(),
            Arc::new(self.output.clone()),
            provider,
        )
    }
}

/// Builds a [`UnitRunner`] on a freshly connected [`WorkerContext`].
pub struct UnitRunnerBuilder {
    provider: Arc<dyn PipelineProvider>,
}

impl UnitRunnerBuilder {
    pub fn new(provider: Arc<dyn PipelineProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl EntryBuilder for UnitRunnerBuilder {
    async fn build(&self, config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
        let context = WorkerContext::connect(Arc::new(config.clone())).await?;
        debug!(disabled = context.database.is_disabled(), "Worker context ready");
        Ok(Arc::new(context.unit_runner(Arc::clone(&self.provider))))
    }
}
