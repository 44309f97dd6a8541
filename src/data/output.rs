//! Output of cleaned data and forecast results.
//!
//! Every run kind writes a per-unit result file. Development runs also store
//! the forecast in `forecast_data`; production runs additionally export it to
//! `forecast_export`. Database destinations are skipped when storage is disabled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use tracing::{debug, info};

use crate::error::{DataError, ForecastError};
use crate::pipeline::{format_month, EngineRunType, RunConfig, UnitConfig};
use crate::runs::UnitRun;
use crate::storage::{Database, DatabaseError};

use super::loader::{processed_data_path, processed_exogenous_path};
use super::records::{
    accuracy, AccountData, CleanedRecord, CleanedRow, ExogenousFeature, ExogenousRow, ExportRecord,
    ForecastFrame, ForecastRecord,
};

/// File name of a unit's forecast result below its output directory.
pub const RESULT_FILE: &str = "result_data.csv";

/// Persists the forecast of one unit to the destinations of the run kind.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn store_forecast(
        &self,
        unit: &UnitConfig,
        unit_run: UnitRun,
        account: &AccountData,
        raw: &ForecastFrame,
        post: &ForecastFrame,
        newest_month: NaiveDate,
    ) -> Result<UnitRun, ForecastError>;
}

/// File and database output of one run.
#[derive(Clone)]
pub struct DataOutput {
    config: Arc<RunConfig>,
    database: Arc<Database>,
}

impl DataOutput {
    pub fn new(config: Arc<RunConfig>, database: Arc<Database>) -> Self {
        Self { config, database }
    }

    /// Stores cleaned data, tagged with `run_id`, and drops cleaned data of older runs.
    ///
    /// With storage disabled one CSV file per contract is written below the
    /// processed data directory instead. Returns the number of rows stored.
    pub async fn store_cleaned_data(
        &self,
        cleaned: &[CleanedRecord],
        run_id: Option<i64>,
    ) -> Result<usize, ForecastError> {
        if self.database.is_disabled() {
            return self.store_cleaned_files(cleaned).await;
        }
        let run_id = run_id.ok_or_else(|| {
            DatabaseError::NotFound("run id for storing cleaned data".to_string())
        })?;

        let rows: Vec<CleanedRow<'_>> = cleaned
            .iter()
            .map(|record| CleanedRow { run_id, record })
            .collect();
        let inserted = self.database.bulk_insert(&rows).await?;

        let mut scope = self.database.begin().await?;
        let result = async {
            let done = sqlx::query("DELETE FROM cleaned_data WHERE run_id < ?")
                .bind(run_id)
                .execute(scope.conn())
                .await?;
            Ok::<u64, DatabaseError>(done.rows_affected())
        }
        .await;
        let deleted = scope.finish(result).await?;
        info!(inserted, deleted, "Stored cleaned data, removed outdated rows");
        Ok(inserted)
    }

    async fn store_cleaned_files(&self, cleaned: &[CleanedRecord]) -> Result<usize, ForecastError> {
        let mut by_contract: BTreeMap<&str, Vec<&CleanedRecord>> = BTreeMap::new();
        for record in cleaned {
            by_contract
                .entry(record.contract_id.as_str())
                .or_default()
                .push(record);
        }

        for (contract, records) in &by_contract {
            let path = processed_data_path(&self.config.data_location, contract);
            let mut writer = csv::Writer::from_writer(Vec::new());
            for record in records {
                writer.serialize(record)?;
            }
            let bytes = writer.into_inner().map_err(|e| e.into_error())?;
            write_file(&path, bytes).await?;
        }

        info!(
            contracts = by_contract.len(),
            rows = cleaned.len(),
            directory = %self.config.data_location.display(),
            "Stored cleaned data to local files"
        );
        Ok(cleaned.len())
    }

    /// Stores exogenous features, tagged with `run_id`, and drops features of older runs.
    ///
    /// With storage disabled the features are written to one CSV file below
    /// the processed data directory. Returns the number of rows stored.
    pub async fn store_exogenous_features(
        &self,
        features: &[ExogenousFeature],
        run_id: Option<i64>,
    ) -> Result<usize, ForecastError> {
        if self.database.is_disabled() {
            let path = processed_exogenous_path(&self.config.data_location);
            let mut writer = csv::Writer::from_writer(Vec::new());
            for feature in features {
                writer.serialize(feature)?;
            }
            let bytes = writer.into_inner().map_err(|e| e.into_error())?;
            write_file(&path, bytes).await?;
            info!(rows = features.len(), path = %path.display(), "Stored exogenous features to local file");
            return Ok(features.len());
        }
        let run_id = run_id.ok_or_else(|| {
            DatabaseError::NotFound("run id for storing exogenous features".to_string())
        })?;

        let rows: Vec<ExogenousRow<'_>> = features
            .iter()
            .map(|record| ExogenousRow { run_id, record })
            .collect();
        let inserted = self.database.bulk_insert(&rows).await?;

        let mut scope = self.database.begin().await?;
        let result = async {
            let done = sqlx::query("DELETE FROM exogenous_feature WHERE run_id < ?")
                .bind(run_id)
                .execute(scope.conn())
                .await?;
            Ok::<u64, DatabaseError>(done.rows_affected())
        }
        .await;
        let deleted = scope.finish(result).await?;
        info!(inserted, deleted, "Stored exogenous features, removed outdated rows");
        Ok(inserted)
    }

    /// Joins raw and post-processed forecasts with the observed actuals.
    ///
    /// A missing actual counts as zero for months up to `newest_month` and
    /// stays unknown afterwards.
    pub fn forecast_records(
        &self,
        account: &AccountData,
        raw: &ForecastFrame,
        post: &ForecastFrame,
        newest_month: NaiveDate,
    ) -> Result<Vec<ForecastRecord>, DataError> {
        if raw.len() != post.len() {
            return Err(DataError::InvalidRecord {
                row: raw.len().min(post.len()) + 1,
                message: "raw and post-processed forecasts differ in length".to_string(),
            });
        }

        let start = self.config.prediction_month;
        raw.points
            .iter()
            .zip(&post.points)
            .enumerate()
            .map(|(index, (raw_point, post_point))| {
                if raw_point.key != post_point.key || raw_point.month != post_point.month {
                    return Err(DataError::InvalidRecord {
                        row: index + 1,
                        message: "raw and post-processed forecasts are not aligned".to_string(),
                    });
                }
                let actual = account
                    .actual(&raw_point.key, raw_point.month)
                    .map(|quantity| quantity.round() as i64)
                    .or_else(|| (raw_point.month <= newest_month).then_some(0));

                Ok(ForecastRecord {
                    model_run_id: None,
                    contract_id: raw_point.key.contract_id.clone(),
                    master_number: raw_point.key.master_number.clone(),
                    item_id: raw_point.key.item_id,
                    prediction_start_month: start,
                    predicted_month: raw_point.month,
                    prediction_months_delta: months_between(start, raw_point.month),
                    prediction_raw: raw_point.value,
                    prediction_post: post_point.value,
                    actual,
                    accuracy: actual.map(|a| accuracy(a as f64, post_point.value)),
                })
            })
            .collect()
    }

    /// Writes the unit's result file and returns its path.
    pub async fn write_result_file(
        &self,
        unit: &str,
        records: &[ForecastRecord],
    ) -> Result<PathBuf, ForecastError> {
        let month_column = match self.config.run_type {
            EngineRunType::Backward => "prediction_end_month",
            _ => "prediction_start_month",
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "contract_id",
            "master_number",
            "item_id",
            month_column,
            "predicted_month",
            "prediction_months_delta",
            "prediction_raw",
            "prediction_post",
            "actual",
            "accuracy",
        ])?;
        for record in records {
            writer.write_record([
                record.contract_id.clone(),
                record.master_number.clone(),
                record.item_id.to_string(),
                format_month(record.prediction_start_month),
                format_month(record.predicted_month),
                record.prediction_months_delta.to_string(),
                record.prediction_raw.to_string(),
                record.prediction_post.to_string(),
                record.actual.map(|a| a.to_string()).unwrap_or_default(),
                record.accuracy.map(|a| a.to_string()).unwrap_or_default(),
            ])?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;

        let path = self.config.unit_output_dir(unit).join(RESULT_FILE);
        write_file(&path, bytes).await?;
        info!(unit, rows = records.len(), path = %path.display(), "Stored forecast result file");
        Ok(path)
    }

    async fn store_internal(
        &self,
        records: &mut [ForecastRecord],
        unit_run: &UnitRun,
    ) -> Result<(), ForecastError> {
        if self.database.is_disabled() {
            debug!(unit = %unit_run.unit, "Database disabled, skipping forecast_data");
            return Ok(());
        }
        for record in records.iter_mut() {
            record.model_run_id = unit_run.id;
        }
        info!(unit = %unit_run.unit, rows = records.len(), "Storing forecast in forecast_data");
        self.database.bulk_insert(records).await?;
        Ok(())
    }

    async fn store_export(
        &self,
        records: &[ForecastRecord],
        unit_run: &UnitRun,
    ) -> Result<(), ForecastError> {
        if self.database.is_disabled() {
            debug!(unit = %unit_run.unit, "Database disabled, skipping forecast_export");
            return Ok(());
        }
        let created_at = Utc::now();
        let export: Vec<ExportRecord> = records
            .iter()
            .map(|record| ExportRecord::from_forecast(record, created_at))
            .collect();
        info!(unit = %unit_run.unit, rows = export.len(), "Storing forecast in forecast_export");
        self.database.bulk_insert(&export).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultWriter for DataOutput {
    async fn store_forecast(
        &self,
        unit: &UnitConfig,
        unit_run: UnitRun,
        account: &AccountData,
        raw: &ForecastFrame,
        post: &ForecastFrame,
        newest_month: NaiveDate,
    ) -> Result<UnitRun, ForecastError> {
        let mut records = self.forecast_records(account, raw, post, newest_month)?;
        self.write_result_file(&unit.name, &records).await?;

        match self.config.run_type {
            EngineRunType::Backward => {
                debug!(unit = %unit.name, "Backward run, forecast stored as file only");
            }
            EngineRunType::Development => {
                self.store_internal(&mut records, &unit_run).await?;
            }
            EngineRunType::Production => {
                self.store_internal(&mut records, &unit_run).await?;
                self.store_export(&records, &unit_run).await?;
            }
        }
        Ok(unit_run)
    }
}

/// Absolute number of months between two month starts.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> u32 {
    let from = from.year() * 12 + from.month() as i32;
    let to = to.year() * 12 + to.month() as i32;
    (to - from).unsigned_abs()
}

async fn write_file(path: &Path, bytes: Vec<u8>) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}
