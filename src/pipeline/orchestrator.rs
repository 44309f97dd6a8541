//! Run orchestrator.
//!
//! This module provides the `Orchestrator` that drives one run:
//! - Run creation and status tracking
//! - Import and cleaning of raw input
//! - Selection of the cleaned data to forecast from
//! - Reconciliation of historical actuals
//! - Unit execution through the [`ExecutionEngine`]
//!
//! Every run ends in a terminal status. An interruption marks the run and its
//! open unit runs CANCELLED; any other error marks the run FAILED. The error
//! is returned unchanged in both cases.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::data::{CleaningSource, CsvCleaningSource, DataOutput, Reconciler};
use crate::error::ForecastError;
use crate::runs::{Run, RunStatus, RunStore, Tracked};
use crate::scheduler::{ExecutionEngine, PoolStats, SharedArgs, WorkerFactory};

use super::context::WorkerContext;
use super::run_config::{format_month, RunConfig};
use super::runner::PipelineProvider;

/// Drives one run from creation to a terminal status.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    store: RunStore,
    cleaning: Arc<dyn CleaningSource>,
    output: DataOutput,
    reconciler: Reconciler,
    engine: ExecutionEngine,
    shutdown: Option<broadcast::Receiver<()>>,
    run: Run,
    status_history: Vec<RunStatus>,
}

impl Orchestrator {
    /// Creates an orchestrator from its collaborators.
    pub fn new(
        context: &WorkerContext,
        cleaning: Arc<dyn CleaningSource>,
        engine: ExecutionEngine,
    ) -> Self {
        Self {
            config: Arc::clone(&context.config),
            store: context.store.clone(),
            cleaning,
            output: context.output.clone(),
            reconciler: context.reconciler.clone(),
            engine,
            shutdown: None,
            run: Run::new(&context.config),
            status_history: Vec::new(),
        }
    }

    /// Connects to storage and wires the default collaborators.
    ///
    /// Units run in the calling task through a [`UnitRunner`](super::UnitRunner)
    /// on the sequential path and in workers from `workers` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `ForecastError::Database` when storage is enabled but unreachable.
    pub async fn from_config(
        config: Arc<RunConfig>,
        workers: Arc<dyn WorkerFactory>,
        provider: Arc<dyn PipelineProvider>,
    ) -> Result<Self, ForecastError> {
        let context = WorkerContext::connect(Arc::clone(&config)).await?;
        let entry = Arc::new(context.unit_runner(provider));
        let engine = ExecutionEngine::new(entry, workers);
        let cleaning = Arc::new(CsvCleaningSource::new(&config.data_location));
        Ok(Self::new(&context, cleaning, engine))
    }

    /// Sets the channel whose signal interrupts the run.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// The run as last recorded.
    pub fn current_run(&self) -> &Run {
        &self.run
    }

    /// Every status the run has entered, in order.
    pub fn status_history(&self) -> &[RunStatus] {
        &self.status_history
    }

    /// Execution statistics of the units run so far.
    pub fn engine_stats(&self) -> PoolStats {
        self.engine.stats()
    }

    /// Runs every phase and records the terminal status.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run, after marking it CANCELLED or
    /// FAILED. Failures to record that status are logged, not returned.
    pub async fn run(&mut self) -> Result<(), ForecastError> {
        let mut shutdown = self.shutdown.take();

        let result = tokio::select! {
            result = self.run_phases() => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                warn!("Interrupt received, cancelling run");
                Err(ForecastError::Cancelled)
            }
        };
        self.shutdown = shutdown;

        match result {
            Ok(()) => {
                info!(run = %self.run.label(), "Run completed");
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                self.record_terminal(RunStatus::Cancelled).await;
                if let Some(run_id) = self.run.id {
                    match self.store.cancel_open_unit_runs(run_id).await {
                        Ok(cancelled) => info!(run_id, cancelled, "Cancelled open unit runs"),
                        Err(status_err) => {
                            error!(run_id, error = %status_err, "Failed to cancel open unit runs")
                        }
                    }
                }
                Err(e)
            }
            Err(e) => {
                error!(run = %self.run.label(), error = %e, "Run failed");
                self.record_terminal(RunStatus::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<(), ForecastError> {
        self.store.insert_run(&mut self.run).await?;
        self.status_history.push(self.run.status);
        info!(
            run = %self.run.label(),
            run_type = %self.config.run_type,
            units = self.config.units.len(),
            prediction_month = %format_month(self.config.prediction_month),
            "Run initialized"
        );

        self.set_status(RunStatus::Preprocess).await?;
        let (cleaned_data_run_id, newest_month) = self.preprocess().await?;

        self.set_status(RunStatus::RunModels).await?;
        let args = SharedArgs {
            run_id: self.run.id,
            cleaned_data_run_id,
            newest_month,
            run_config: self.config.as_ref().clone(),
        };
        self.engine
            .execute(&self.config.units, self.config.parallelism, args)
            .await?;

        self.set_status(RunStatus::Completed).await?;
        Ok(())
    }

    /// Global preprocessing shared by every unit.
    ///
    /// Returns the cleaned data run id and the newest cleaned month.
    async fn preprocess(&self) -> Result<(Option<i64>, NaiveDate), ForecastError> {
        let includes_cleaning = self.config.includes_cleaning;
        if includes_cleaning {
            info!("Starting import of exogenous features");
            let features = self.cleaning.load_exogenous_features().await?;
            let stored = self
                .output
                .store_exogenous_features(&features, self.run.id)
                .await?;
            info!(rows = stored, "Stored exogenous features");

            info!("Starting import and cleaning of raw input");
            let raw = self.cleaning.load_raw_input().await?;
            self.cleaning.validate(&raw)?;
            let cleaned = self.cleaning.clean(raw);
            let stored = self.output.store_cleaned_data(&cleaned, self.run.id).await?;
            info!(rows = stored, "Stored cleaned data");
        } else {
            info!(run_type = %self.config.run_type, "Skipping data cleaning");
        }

        let cleaned_data_run_id = self
            .reconciler
            .cleaned_data_run_id(includes_cleaning, self.run.id)
            .await?;
        let newest_month = self
            .reconciler
            .newest_month(cleaned_data_run_id, self.config.prediction_month)
            .await?;
        info!(
            newest_month = %format_month(newest_month),
            cleaned_data_run_id = ?cleaned_data_run_id,
            "Resolved cleaned data"
        );

        if includes_cleaning {
            let updated = self
                .reconciler
                .update_actuals(cleaned_data_run_id, newest_month)
                .await?;
            info!(updated, "Updated actuals of previous forecasts");
        } else {
            info!(run_type = %self.config.run_type, "Skipping update of previous forecasts");
        }

        Ok((cleaned_data_run_id, newest_month))
    }

    async fn set_status(&mut self, status: RunStatus) -> Result<(), ForecastError> {
        self.store.update_run_status(&mut self.run, status).await?;
        self.status_history.push(self.run.status);
        Ok(())
    }

    async fn record_terminal(&mut self, status: RunStatus) {
        if let Err(e) = self.set_status(status).await {
            error!(run = %self.run.label(), status = %status, error = %e, "Failed to record run status");
        }
    }
}

/// Resolves when a shutdown signal arrives. Never resolves without a channel
/// or after every sender is gone.
async fn wait_for_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CleanedRecord, ExogenousFeature, RawRecord};
    use crate::error::DataError;
    use crate::pipeline::{
        DatabaseConfig, EngineConfig, EngineRunType, RunParameters, UnitConfig,
    };
    use crate::runs::UnitRunStatus;
    use crate::scheduler::{EntryBuilder, LocalWorkerFactory, UnitEntry, UnitJob};
    use crate::storage::Database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct StaticCleaning(Vec<RawRecord>);

    #[async_trait]
    impl CleaningSource for StaticCleaning {
        async fn load_raw_input(&self) -> Result<Vec<RawRecord>, DataError> {
            Ok(self.0.clone())
        }

        async fn load_exogenous_features(&self) -> Result<Vec<ExogenousFeature>, DataError> {
            Ok(vec![ExogenousFeature {
                periodic_data_stream: "Build rates".to_string(),
                airframe: "A320".to_string(),
                contract_id: "C1".to_string(),
                project_id: "P1".to_string(),
                date: NaiveDate::from_ymd_opt(2020, 3, 1),
                value: Some(4.0),
            }])
        }

        fn validate(&self, raw: &[RawRecord]) -> Result<(), DataError> {
            crate::data::validate_records(raw)
        }

        fn clean(&self, raw: Vec<RawRecord>) -> Vec<CleanedRecord> {
            crate::data::clean_records(raw)
        }
    }

    /// Never finishes a unit.
    struct StuckEntry;

    #[async_trait]
    impl UnitEntry for StuckEntry {
        async fn run_unit(&self, _job: UnitJob) -> Result<(), ForecastError> {
            std::future::pending().await
        }
    }

    struct StuckBuilder;

    #[async_trait]
    impl EntryBuilder for StuckBuilder {
        async fn build(&self, _config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
            Ok(Arc::new(StuckEntry))
        }
    }

    fn raw(contract: &str) -> RawRecord {
        RawRecord {
            project_id: "P1".to_string(),
            contract_id: contract.to_string(),
            master_number: "M1".to_string(),
            date: NaiveDate::from_ymd_opt(2020, 3, 12).unwrap(),
            item_id: 1,
            unit_cost: 2.0,
            order_quantity: 5.0,
        }
    }

    async fn context(dir: &TempDir, run_type: EngineRunType) -> WorkerContext {
        context_with_units(dir, run_type, vec![UnitConfig::new("Account_1", ["C1"])], 1).await
    }

    async fn context_with_units(
        dir: &TempDir,
        run_type: EngineRunType,
        units: Vec<UnitConfig>,
        parallelism: usize,
    ) -> WorkerContext {
        let engine = EngineConfig::default()
            .with_units(units)
            .with_database(DatabaseConfig::sqlite_file(dir.path().join("forecast.db")))
            .with_output_location(dir.path().join("output"))
            .with_data_location(dir.path());
        let params = RunParameters::new(run_type)
            .with_prediction_month(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap())
            .with_parallelism(parallelism);
        let config = Arc::new(RunConfig::new(&engine, params).unwrap());
        let database = Arc::new(Database::connect(&config.database).await.unwrap());
        database.run_migrations().await.unwrap();
        WorkerContext::with_database(config, database)
    }

    /// Sleeps, then counts the unit as finished.
    struct SlowEntry(Arc<AtomicUsize>);

    #[async_trait]
    impl UnitEntry for SlowEntry {
        async fn run_unit(&self, _job: UnitJob) -> Result<(), ForecastError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowBuilder(Arc<AtomicUsize>);

    #[async_trait]
    impl EntryBuilder for SlowBuilder {
        async fn build(&self, _config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
            Ok(Arc::new(SlowEntry(Arc::clone(&self.0))))
        }
    }

    fn stuck_engine() -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(StuckEntry),
            Arc::new(LocalWorkerFactory::new(Arc::new(StuckBuilder))),
        )
    }

    #[tokio::test]
    async fn test_invalid_input_fails_run() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir, EngineRunType::Development).await;
        let mut orchestrator =
            Orchestrator::new(&context, Arc::new(StaticCleaning(Vec::new())), stuck_engine());

        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, ForecastError::Data(DataError::EmptyInput)));
        assert_eq!(
            orchestrator.status_history(),
            &[RunStatus::Initialized, RunStatus::Preprocess, RunStatus::Failed]
        );
        let run_id = orchestrator.current_run().id.unwrap();
        let stored = context.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.end.is_some());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_run_and_open_unit_runs() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir, EngineRunType::Development).await;
        let (tx, rx) = broadcast::channel(1);
        let mut orchestrator =
            Orchestrator::new(&context, Arc::new(StaticCleaning(vec![raw("C1")])), stuck_engine())
                .with_shutdown(rx);

        let store = context.store.clone();
        let interrupter = tokio::spawn(async move {
            // Wait for the run to reach RUN_MODELS, then leave an open unit run behind.
            loop {
                let runs = store.list_runs(1).await.unwrap();
                if let Some(run) = runs.first() {
                    if run.status == RunStatus::RunModels {
                        let mut unit_run = crate::runs::UnitRun::new(run.id, "Account_1");
                        store.insert_unit_run(&mut unit_run).await.unwrap();
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tx.send(()).unwrap();
        });

        let err = orchestrator.run().await.unwrap_err();
        interrupter.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(orchestrator.current_run().status, RunStatus::Cancelled);
        let run_id = orchestrator.current_run().id.unwrap();
        let unit_runs = context.store.unit_runs_for(run_id).await.unwrap();
        assert_eq!(unit_runs.len(), 1);
        assert_eq!(unit_runs[0].status, UnitRunStatus::Cancelled);

        // Preprocessing imported the exogenous features under this run
        let imported: Vec<(i64, String)> =
            sqlx::query_as("SELECT run_id, airframe FROM exogenous_feature")
                .fetch_all(context.database.pool().unwrap())
                .await
                .unwrap();
        assert_eq!(imported, vec![(run_id, "A320".to_string())]);
    }

    #[tokio::test]
    async fn test_interrupt_stops_units_running_in_local_workers() {
        let dir = TempDir::new().unwrap();
        let units = vec![
            UnitConfig::new("Account_1", ["C1"]),
            UnitConfig::new("Account_2", ["C2"]),
        ];
        let context = context_with_units(&dir, EngineRunType::Development, units, 2).await;
        assert_eq!(context.config.parallelism, 2);

        let finished = Arc::new(AtomicUsize::new(0));
        let engine = ExecutionEngine::new(
            Arc::new(SlowEntry(Arc::clone(&finished))),
            Arc::new(LocalWorkerFactory::new(Arc::new(SlowBuilder(Arc::clone(
                &finished,
            ))))),
        );
        let (tx, rx) = broadcast::channel(1);
        let mut orchestrator = Orchestrator::new(
            &context,
            Arc::new(StaticCleaning(vec![raw("C1"), raw("C2")])),
            engine,
        )
        .with_shutdown(rx);

        let store = context.store.clone();
        let interrupter = tokio::spawn(async move {
            loop {
                let runs = store.list_runs(1).await.unwrap();
                if runs.first().map(|r| r.status) == Some(RunStatus::RunModels) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(()).unwrap();
        });

        let err = orchestrator.run().await.unwrap_err();
        interrupter.await.unwrap();
        assert!(err.is_cancelled());
        assert_eq!(orchestrator.current_run().status, RunStatus::Cancelled);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_shutdown_channel_does_not_cancel() {
        let mut shutdown = None;
        let (tx, rx) = broadcast::channel::<()>(1);
        drop(tx);
        let mut closed = Some(rx);

        let waited = tokio::time::timeout(Duration::from_millis(20), wait_for_shutdown(&mut closed));
        assert!(waited.await.is_err());
        let waited =
            tokio::time::timeout(Duration::from_millis(20), wait_for_shutdown(&mut shutdown));
        assert!(waited.await.is_err());
    }
}
