//! Unit runner executing one unit's pipeline under status tracking.
//!
//! This module provides the `UnitRunner`, which loads a unit's account data,
//! walks it through the stages of a [`UnitPipeline`] and stores the result,
//! moving the unit run through its statuses before each stage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Months, NaiveDate};
use tracing::{error, info, info_span, Instrument};

use crate::data::{
    months_between, AccountData, DataLoader, ForecastFrame, ForecastPoint, ResultWriter,
    TrainingSet,
};
use crate::error::{DataError, ForecastError};
use crate::runs::{RunStore, UnitRun, UnitRunStatus};
use crate::scheduler::{UnitEntry, UnitJob};

use super::config::UnitConfig;
use super::run_config::{EngineRunType, RunConfig};

/// Forecasting stages of one unit.
pub trait UnitPipeline: Send + Sync {
    /// Filters and checks the account data used for training.
    fn preprocess(&self, account: &AccountData) -> Result<AccountData, ForecastError>;

    fn prepare_training(&self, account: &AccountData) -> Result<TrainingSet, ForecastError>;

    fn forecast(&self, training: &TrainingSet) -> Result<ForecastFrame, ForecastError>;

    fn postprocess(&self, raw: &ForecastFrame) -> Result<ForecastFrame, ForecastError>;
}

/// Supplies the pipeline of each unit.
pub trait PipelineProvider: Send + Sync {
    fn pipeline(&self, unit: &UnitConfig, config: &RunConfig) -> Box<dyn UnitPipeline>;
}

/// Provides [`MovingAveragePipeline`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineProvider;

impl PipelineProvider for BaselineProvider {
    fn pipeline(&self, unit: &UnitConfig, config: &RunConfig) -> Box<dyn UnitPipeline> {
        Box::new(MovingAveragePipeline::new(unit, config))
    }
}

/// Baseline forecast: the mean of the last `lookback_months` of each
/// (contract, item) series, repeated over the forecast window.
#[derive(Debug, Clone)]
pub struct MovingAveragePipeline {
    unit: String,
    lookback: usize,
    forecast_start: NaiveDate,
    horizon: Vec<NaiveDate>,
}

impl MovingAveragePipeline {
    pub fn new(unit: &UnitConfig, config: &RunConfig) -> Self {
        Self {
            unit: unit.name.clone(),
            lookback: unit.lookback_months.max(1) as usize,
            forecast_start: config.forecast_start,
            horizon: config.forecast_months(),
        }
    }

    fn empty(&self) -> ForecastError {
        DataError::EmptyData {
            unit: self.unit.clone(),
        }
        .into()
    }
}

impl UnitPipeline for MovingAveragePipeline {
    fn preprocess(&self, account: &AccountData) -> Result<AccountData, ForecastError> {
        if account.is_empty() {
            return Err(self.empty());
        }
        let history: Vec<_> = account
            .records
            .iter()
            .filter(|r| r.date < self.forecast_start)
            .cloned()
            .collect();
        if history.is_empty() {
            return Err(self.empty());
        }
        Ok(AccountData::new(account.unit.clone(), history))
    }

    fn prepare_training(&self, account: &AccountData) -> Result<TrainingSet, ForecastError> {
        let series = account
            .monthly_series()
            .into_iter()
            .filter_map(|(key, months)| {
                let first = *months.keys().next()?;
                let mut values = Vec::new();
                let mut month = first;
                while month < self.forecast_start {
                    values.push(months.get(&month).copied().unwrap_or(0.0));
                    month = month.checked_add_months(Months::new(1))?;
                }
                Some((key, values))
            })
            .collect();

        Ok(TrainingSet {
            series,
            horizon: self.horizon.clone(),
        })
    }

    fn forecast(&self, training: &TrainingSet) -> Result<ForecastFrame, ForecastError> {
        let mut points = Vec::with_capacity(training.series.len() * training.horizon.len());
        for (key, values) in &training.series {
            let window = &values[values.len().saturating_sub(self.lookback)..];
            let mean = if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            };
            for month in &training.horizon {
                points.push(ForecastPoint {
                    key: key.clone(),
                    month: *month,
                    delta: months_between(self.forecast_start, *month),
                    value: mean,
                });
            }
        }
        Ok(ForecastFrame { points })
    }

    fn postprocess(&self, raw: &ForecastFrame) -> Result<ForecastFrame, ForecastError> {
        let points = raw
            .points
            .iter()
            .map(|point| ForecastPoint {
                value: point.value.max(0.0).round(),
                ..point.clone()
            })
            .collect();
        Ok(ForecastFrame { points })
    }
}

/// Runs single units and records their progress.
pub struct UnitRunner {
    config: Arc<RunConfig>,
    store: RunStore,
    loader: DataLoader,
    writer: Arc<dyn ResultWriter>,
    provider: Arc<dyn PipelineProvider>,
}

impl UnitRunner {
    pub fn new(
        config: Arc<RunConfig>,
        store: RunStore,
        loader: DataLoader,
        writer: Arc<dyn ResultWriter>,
        provider: Arc<dyn PipelineProvider>,
    ) -> Self {
        Self {
            config,
            store,
            loader,
            writer,
            provider,
        }
    }

    /// Runs one unit and returns its final unit run.
    ///
    /// # Errors
    ///
    /// Any stage error is logged, the unit run is marked FAILED and the
    /// error is returned unchanged.
    pub async fn run(&self, job: &UnitJob) -> Result<UnitRun, ForecastError> {
        self.log_destination(&job.unit);

        let mut unit_run = UnitRun::new(job.args.run_id, job.unit.name.clone());
        self.store.insert_unit_run(&mut unit_run).await?;

        match self.run_stages(job, &mut unit_run).await {
            Ok(()) => Ok(unit_run),
            Err(e) => {
                error!(error = %e, "Unit run failed");
                if let Err(status_err) = self
                    .store
                    .update_unit_status(&mut unit_run, UnitRunStatus::Failed)
                    .await
                {
                    error!(error = %status_err, "Failed to record unit run failure");
                }
                Err(e)
            }
        }
    }

    async fn run_stages(&self, job: &UnitJob, unit_run: &mut UnitRun) -> Result<(), ForecastError> {
        let pipeline = self.provider.pipeline(&job.unit, &self.config);

        self.store
            .update_unit_status(unit_run, UnitRunStatus::LoadData)
            .await?;
        let account = self
            .loader
            .load_account_data(&job.unit, job.args.cleaned_data_run_id)
            .await?;

        self.store
            .update_unit_status(unit_run, UnitRunStatus::Preprocess)
            .await?;
        let history = pipeline.preprocess(&account)?;

        self.store
            .update_unit_status(unit_run, UnitRunStatus::PrepareTraining)
            .await?;
        let training = pipeline.prepare_training(&history)?;

        self.store
            .update_unit_status(unit_run, UnitRunStatus::Forecast)
            .await?;
        let raw = pipeline.forecast(&training)?;

        self.store
            .update_unit_status(unit_run, UnitRunStatus::Postprocess)
            .await?;
        let post = pipeline.postprocess(&raw)?;

        *unit_run = self
            .writer
            .store_forecast(
                &job.unit,
                unit_run.clone(),
                &account,
                &raw,
                &post,
                job.args.newest_month,
            )
            .await?;

        self.store
            .update_unit_status(unit_run, UnitRunStatus::Completed)
            .await?;
        info!(points = post.len(), "Unit run completed");
        Ok(())
    }

    fn log_destination(&self, unit: &UnitConfig) {
        match self.config.run_type {
            EngineRunType::Backward => {
                let path = self.config.unit_output_dir(&unit.name);
                info!(path = %path.display(), "Forecasting unit to result file");
            }
            EngineRunType::Development => info!("Forecasting unit to internal database"),
            EngineRunType::Production => {
                info!("Forecasting unit to internal database and export table")
            }
        }
    }
}

#[async_trait]
impl UnitEntry for UnitRunner {
    async fn run_unit(&self, job: UnitJob) -> Result<(), ForecastError> {
        let span = info_span!("unit", unit = %job.unit.name);
        self.run(&job).instrument(span).await.map(|_| ())
    }
}
