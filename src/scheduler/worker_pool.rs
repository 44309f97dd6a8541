//! Execution engine running units sequentially or in a worker pool.
//!
//! With a parallelism of one (or a single unit) every unit runs in the
//! calling task, in declaration order. Otherwise a bounded set of worker
//! slots pulls units from a shared queue. Each slot owns one worker from a
//! [`WorkerFactory`]; a worker that dies is dropped and the slot spawns a
//! fresh one for its next unit.
//!
//! # Features
//!
//! - Outcomes reported in submission order regardless of completion order
//! - A failing unit never stops its siblings
//! - Crashed workers surface as `WorkerCrashed` for the affected unit
//! - Pool statistics tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ForecastError;
use crate::pipeline::{RunConfig, UnitConfig};

use super::job::{SharedArgs, UnitJob};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Spawning or initializing a worker failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// The worker protocol was violated.
    #[error("Worker protocol error: {0}")]
    Protocol(String),
}

/// Runs one unit to completion.
#[async_trait]
pub trait UnitEntry: Send + Sync {
    async fn run_unit(&self, job: UnitJob) -> Result<(), ForecastError>;
}

/// Builds a unit entry from plain run configuration.
///
/// Workers call this once, on their first unit, and reuse the result.
#[async_trait]
pub trait EntryBuilder: Send + Sync {
    async fn build(&self, config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError>;
}

/// One isolated executor owned by a pool slot.
#[async_trait]
pub trait Worker: Send {
    fn id(&self) -> &str;

    /// Runs one unit. A dead worker reports `ForecastError::WorkerCrashed`.
    async fn run(&mut self, job: UnitJob) -> Result<(), ForecastError>;

    /// Whether the worker can accept another unit.
    fn is_alive(&self) -> bool;

    async fn shutdown(self: Box<Self>);
}

/// Spawns workers for pool slots.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self, worker_id: String) -> Result<Box<dyn Worker>, PoolError>;
}

/// Worker running units as tasks of the current process.
///
/// Each unit runs in its own task so a panic is contained to the worker.
/// The task is aborted when the pending `run` future is dropped.
pub struct LocalWorker {
    id: String,
    builder: Arc<dyn EntryBuilder>,
    entry: Option<Arc<dyn UnitEntry>>,
    alive: bool,
}

impl LocalWorker {
    pub fn new(id: impl Into<String>, builder: Arc<dyn EntryBuilder>) -> Self {
        Self {
            id: id.into(),
            builder,
            entry: None,
            alive: true,
        }
    }

    async fn entry(&mut self, config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
        if let Some(entry) = &self.entry {
            return Ok(Arc::clone(entry));
        }
        debug!(worker_id = %self.id, "Building worker context");
        let entry = self.builder.build(config).await?;
        self.entry = Some(Arc::clone(&entry));
        Ok(entry)
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, job: UnitJob) -> Result<(), ForecastError> {
        let unit = job.unit.name.clone();
        if !self.alive {
            return Err(ForecastError::WorkerCrashed {
                unit,
                message: format!("worker {} is no longer running", self.id),
            });
        }

        let entry = self.entry(&job.args.run_config).await?;
        // Dropping the set aborts the unit when the caller stops waiting.
        let mut running = JoinSet::new();
        running.spawn(async move { entry.run_unit(job).await });
        match running.join_next().await {
            Some(Ok(result)) => result,
            None => {
                self.alive = false;
                Err(ForecastError::WorkerCrashed {
                    unit,
                    message: "unit task vanished".to_string(),
                })
            }
            Some(Err(e)) => {
                self.alive = false;
                Err(ForecastError::WorkerCrashed {
                    unit,
                    message: e.to_string(),
                })
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn shutdown(self: Box<Self>) {
        debug!(worker_id = %self.id, "Local worker stopped");
    }
}

/// Factory for [`LocalWorker`]s.
pub struct LocalWorkerFactory {
    builder: Arc<dyn EntryBuilder>,
}

impl LocalWorkerFactory {
    pub fn new(builder: Arc<dyn EntryBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl WorkerFactory for LocalWorkerFactory {
    async fn spawn(&self, worker_id: String) -> Result<Box<dyn Worker>, PoolError> {
        Ok(Box::new(LocalWorker::new(worker_id, Arc::clone(&self.builder))))
    }
}

/// Statistics about unit execution.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of workers spawned, respawns included.
    pub workers_spawned: u64,
    /// Number of workers currently running a unit.
    pub active_workers: usize,
    /// Total number of units completed successfully.
    pub units_completed: u64,
    /// Total number of units that failed.
    pub units_failed: u64,
    /// Average unit duration.
    pub average_unit_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of units processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.units_completed + self.units_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.units_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking execution statistics.
struct SharedPoolStats {
    units_completed: AtomicU64,
    units_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
    workers_spawned: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            units_completed: AtomicU64::new(0),
            units_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
        }
    }

    fn record(&self, succeeded: bool, duration: Duration) {
        if succeeded {
            self.units_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.units_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_spawn(&self) {
        self.workers_spawned.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self) -> PoolStats {
        let completed = self.units_completed.load(Ordering::SeqCst);
        let failed = self.units_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_units = completed + failed;
        let average_duration = if total_units > 0 {
            Duration::from_millis(total_duration_ms / total_units)
        } else {
            Duration::ZERO
        };

        PoolStats {
            workers_spawned: self.workers_spawned.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            units_completed: completed,
            units_failed: failed,
            average_unit_duration: average_duration,
        }
    }
}

/// Result of one unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: String,
    pub result: Result<(), ForecastError>,
}

/// Outcomes of every submitted unit, in submission order.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub outcomes: Vec<UnitOutcome>,
}

impl ExecutionReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    /// Succeeds when every unit succeeded, otherwise returns the last failure.
    pub fn into_result(self) -> Result<(), ForecastError> {
        self.outcomes
            .into_iter()
            .filter_map(|o| o.result.err())
            .last()
            .map_or(Ok(()), Err)
    }
}

type JobQueue = Arc<Mutex<VecDeque<UnitJob>>>;

/// Runs the units of one run.
pub struct ExecutionEngine {
    entry: Arc<dyn UnitEntry>,
    workers: Arc<dyn WorkerFactory>,
    stats: Arc<SharedPoolStats>,
}

impl ExecutionEngine {
    /// Creates an engine.
    ///
    /// # Arguments
    ///
    /// * `entry` - Runs units in the calling task on the sequential path
    /// * `workers` - Spawns pool workers on the parallel path
    pub fn new(entry: Arc<dyn UnitEntry>, workers: Arc<dyn WorkerFactory>) -> Self {
        Self {
            entry,
            workers,
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Runs every unit and fails with the last unit failure, if any.
    pub async fn execute(
        &self,
        units: &[UnitConfig],
        parallelism: usize,
        args: SharedArgs,
    ) -> Result<(), ForecastError> {
        let report = self.run_all(units, parallelism, args).await;
        if report.failed() > 0 {
            warn!(
                completed = report.completed(),
                failed = report.failed(),
                "Some units failed"
            );
        }
        report.into_result()
    }

    /// Runs every unit and reports each outcome.
    pub async fn run_all(
        &self,
        units: &[UnitConfig],
        parallelism: usize,
        args: SharedArgs,
    ) -> ExecutionReport {
        let jobs: Vec<UnitJob> = units
            .iter()
            .enumerate()
            .map(|(index, unit)| UnitJob::new(index, unit.clone(), args.clone()))
            .collect();

        if parallelism <= 1 || jobs.len() <= 1 {
            info!(units = jobs.len(), "Executing units sequentially");
            self.run_sequential(jobs).await
        } else {
            let slots = parallelism.min(jobs.len());
            info!(units = jobs.len(), workers = slots, "Executing units in worker pool");
            self.run_pool(jobs, slots).await
        }
    }

    /// Returns current execution statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats()
    }

    async fn run_sequential(&self, jobs: Vec<UnitJob>) -> ExecutionReport {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let unit = job.unit.name.clone();
            let start = Instant::now();
            self.stats.increment_active();
            let result = self.entry.run_unit(job).await;
            self.stats.decrement_active();
            self.stats.record(result.is_ok(), start.elapsed());

            if let Err(e) = &result {
                warn!(unit = %unit, error = %e, "Unit failed, continuing with remaining units");
            }
            outcomes.push(UnitOutcome { unit, result });
        }
        ExecutionReport { outcomes }
    }

    async fn run_pool(&self, jobs: Vec<UnitJob>, slots: usize) -> ExecutionReport {
        let names: Vec<String> = jobs.iter().map(|j| j.unit.name.clone()).collect();
        let queue: JobQueue = Arc::new(Mutex::new(jobs.into()));

        let mut set = JoinSet::new();
        for slot in 0..slots {
            let queue = Arc::clone(&queue);
            let workers = Arc::clone(&self.workers);
            let stats = Arc::clone(&self.stats);
            set.spawn(run_slot(slot, queue, workers, stats));
        }

        let mut results: Vec<Option<Result<(), ForecastError>>> =
            names.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(slot_outcomes) => {
                    for (index, result) in slot_outcomes {
                        if let Some(entry) = results.get_mut(index) {
                            *entry = Some(result);
                        }
                    }
                }
                Err(e) => error!(error = %e, "Worker slot panicked"),
            }
        }

        let outcomes = names
            .into_iter()
            .zip(results)
            .map(|(unit, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ForecastError::WorkerCrashed {
                        unit: unit.clone(),
                        message: "no outcome reported".to_string(),
                    })
                });
                UnitOutcome { unit, result }
            })
            .collect();
        ExecutionReport { outcomes }
    }
}

/// Pulls units from the queue until it is empty, respawning dead workers.
async fn run_slot(
    slot: usize,
    queue: JobQueue,
    workers: Arc<dyn WorkerFactory>,
    stats: Arc<SharedPoolStats>,
) -> Vec<(usize, Result<(), ForecastError>)> {
    let mut outcomes = Vec::new();
    let mut worker: Option<Box<dyn Worker>> = None;
    let mut generation = 0;

    loop {
        let Some(job) = queue.lock().await.pop_front() else {
            break;
        };
        let index = job.index;
        let unit = job.unit.name.clone();

        if worker.is_none() {
            let worker_id = format!("worker-{}.{}", slot, generation);
            generation += 1;
            match workers.spawn(worker_id.clone()).await {
                Ok(spawned) => {
                    stats.record_spawn();
                    info!(worker_id = %worker_id, "Worker started");
                    worker = Some(spawned);
                }
                Err(e) => {
                    error!(worker_id = %worker_id, unit = %unit, error = %e, "Failed to start worker");
                    stats.record(false, Duration::ZERO);
                    outcomes.push((index, Err(ForecastError::Pool(e))));
                    continue;
                }
            }
        }

        let Some(current) = worker.as_mut() else {
            continue;
        };
        debug!(worker_id = %current.id(), unit = %unit, "Dispatching unit");

        let start = Instant::now();
        stats.increment_active();
        let result = current.run(job).await;
        stats.decrement_active();
        stats.record(result.is_ok(), start.elapsed());

        match &result {
            Ok(()) => info!(worker_id = %current.id(), unit = %unit, "Unit finished"),
            Err(e) => warn!(worker_id = %current.id(), unit = %unit, error = %e, "Unit failed"),
        }

        if !current.is_alive() {
            warn!(worker_id = %current.id(), "Worker died, replacing it");
            if let Some(dead) = worker.take() {
                dead.shutdown().await;
            }
        }
        outcomes.push((index, result));
    }

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use crate::pipeline::{EngineConfig, EngineRunType, RunParameters};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Records the units it ran; fails or panics for configured names.
    #[derive(Default)]
    struct RecordingEntry {
        ran: StdMutex<Vec<String>>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
    }

    #[async_trait]
    impl UnitEntry for RecordingEntry {
        async fn run_unit(&self, job: UnitJob) -> Result<(), ForecastError> {
            let name = job.unit.name.clone();
            self.ran.lock().unwrap().push(name.clone());
            if self.panicking.contains(&name) {
                panic!("unit {} exploded", name);
            }
            if self.failing.contains(&name) {
                return Err(DataError::EmptyData { unit: name }.into());
            }
            Ok(())
        }
    }

    struct SharedBuilder(Arc<RecordingEntry>);

    #[async_trait]
    impl EntryBuilder for SharedBuilder {
        async fn build(&self, _config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
            Ok(self.0.clone())
        }
    }

    fn units(names: &[&str]) -> Vec<UnitConfig> {
        names.iter().map(|n| UnitConfig::new(*n, ["C1"])).collect()
    }

    fn args(units: &[UnitConfig]) -> SharedArgs {
        let engine = EngineConfig::default().with_units(units.to_vec());
        let config = RunConfig::new(&engine, RunParameters::new(EngineRunType::Backward)).unwrap();
        SharedArgs {
            run_id: None,
            cleaned_data_run_id: None,
            newest_month: config.prediction_month,
            run_config: config,
        }
    }

    fn engine(entry: RecordingEntry) -> (ExecutionEngine, Arc<RecordingEntry>) {
        let entry = Arc::new(entry);
        let factory = LocalWorkerFactory::new(Arc::new(SharedBuilder(entry.clone())));
        (ExecutionEngine::new(entry.clone(), Arc::new(factory)), entry)
    }

    fn failing(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sequential_runs_in_order_and_continues_after_failure() {
        let (engine, entry) = engine(RecordingEntry {
            failing: failing(&["b"]),
            ..Default::default()
        });
        let units = units(&["a", "b", "c"]);

        let report = engine.run_all(&units, 1, args(&units)).await;

        assert_eq!(*entry.ran.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.completed(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[1].result.is_err());

        let stats = engine.stats();
        assert_eq!(stats.units_completed, 2);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.workers_spawned, 0);
    }

    #[tokio::test]
    async fn test_pool_reports_in_submission_order() {
        let (engine, entry) = engine(RecordingEntry {
            failing: failing(&["d"]),
            ..Default::default()
        });
        let units = units(&["a", "b", "c", "d", "e"]);

        let report = engine.run_all(&units, 3, args(&units)).await;

        let names: Vec<_> = report.outcomes.iter().map(|o| o.unit.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[3].result.is_err());
        assert_eq!(entry.ran.lock().unwrap().len(), 5);
        assert!(engine.stats().workers_spawned <= 3);
    }

    #[tokio::test]
    async fn test_pool_and_sequential_agree() {
        let units = units(&["a", "b", "c", "d"]);

        let (sequential, _) = engine(RecordingEntry {
            failing: failing(&["b", "d"]),
            ..Default::default()
        });
        let (pooled, _) = engine(RecordingEntry {
            failing: failing(&["b", "d"]),
            ..Default::default()
        });

        let a = sequential.run_all(&units, 1, args(&units)).await;
        let b = pooled.run_all(&units, 4, args(&units)).await;

        let shape = |r: &ExecutionReport| -> Vec<(String, bool)> {
            r.outcomes
                .iter()
                .map(|o| (o.unit.clone(), o.result.is_ok()))
                .collect()
        };
        assert_eq!(shape(&a), shape(&b));
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced() {
        let (engine, entry) = engine(RecordingEntry {
            panicking: failing(&["a"]),
            ..Default::default()
        });
        let units = units(&["a", "b", "c"]);

        let report = engine.run_all(&units, 2, args(&units)).await;

        assert!(matches!(
            report.outcomes[0].result,
            Err(ForecastError::WorkerCrashed { .. })
        ));
        assert!(report.outcomes[1].result.is_ok());
        assert!(report.outcomes[2].result.is_ok());
        assert_eq!(entry.ran.lock().unwrap().len(), 3);
    }

    /// Sleeps, then counts the unit as finished.
    struct SlowEntry {
        finished: Arc<AtomicU64>,
    }

    #[async_trait]
    impl UnitEntry for SlowEntry {
        async fn run_unit(&self, _job: UnitJob) -> Result<(), ForecastError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowBuilder(Arc<AtomicU64>);

    #[async_trait]
    impl EntryBuilder for SlowBuilder {
        async fn build(&self, _config: &RunConfig) -> Result<Arc<dyn UnitEntry>, ForecastError> {
            Ok(Arc::new(SlowEntry {
                finished: Arc::clone(&self.0),
            }))
        }
    }

    #[tokio::test]
    async fn test_dropping_pool_run_aborts_local_units() {
        let finished = Arc::new(AtomicU64::new(0));
        let engine = ExecutionEngine::new(
            Arc::new(SlowEntry {
                finished: Arc::clone(&finished),
            }),
            Arc::new(LocalWorkerFactory::new(Arc::new(SlowBuilder(Arc::clone(
                &finished,
            ))))),
        );
        let units = units(&["a", "b"]);

        let run = engine.run_all(&units, 2, args(&units));
        assert!(tokio::time::timeout(Duration::from_millis(50), run)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_returns_last_failure() {
        let (engine, _) = engine(RecordingEntry {
            failing: failing(&["a", "c"]),
            ..Default::default()
        });
        let units = units(&["a", "b", "c"]);

        let err = engine.execute(&units, 1, args(&units)).await.unwrap_err();
        match err {
            ForecastError::Data(DataError::EmptyData { unit }) => assert_eq!(unit, "c"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_unit_ignores_parallelism() {
        let (engine, _) = engine(RecordingEntry::default());
        let units = units(&["only"]);

        let report = engine.run_all(&units, 8, args(&units)).await;
        assert_eq!(report.completed(), 1);
        assert_eq!(engine.stats().workers_spawned, 0);
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats {
            units_completed: 3,
            units_failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::WorkerInitFailed("no binary".to_string());
        assert_eq!(err.to_string(), "Worker initialization failed: no binary");

        let err = PoolError::Protocol("reply for unit 3, expected 1".to_string());
        assert!(err.to_string().starts_with("Worker protocol error"));
    }
}
