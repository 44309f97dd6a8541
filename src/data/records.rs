//! Record types flowing through preprocessing and the unit pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::Sqlite;

use crate::pipeline::month_key;
use crate::storage::schema::tables;
use crate::storage::BulkRow;

/// One order line as delivered in the raw input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub project_id: String,
    pub contract_id: String,
    pub master_number: String,
    pub date: NaiveDate,
    pub item_id: i64,
    pub unit_cost: f64,
    pub order_quantity: f64,
}

/// Monthly aggregated demand of one item under one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CleanedRecord {
    pub project_id: String,
    pub contract_id: String,
    pub master_number: String,
    /// First day of the month.
    pub date: NaiveDate,
    pub item_id: i64,
    pub unit_cost: f64,
    pub order_quantity: f64,
    pub order_cost: f64,
}

impl CleanedRecord {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            contract_id: self.contract_id.clone(),
            master_number: self.master_number.clone(),
            item_id: self.item_id,
        }
    }
}

/// A cleaned record tagged with the run that produced it, for bulk insert.
pub struct CleanedRow<'a> {
    pub run_id: i64,
    pub record: &'a CleanedRecord,
}

impl BulkRow for CleanedRow<'_> {
    const TABLE: &'static str = tables::CLEANED_DATA;
    const COLUMNS: &'static [&'static str] = &[
        "run_id",
        "project_id",
        "contract_id",
        "master_number",
        "date",
        "date_yyyymm",
        "item_id",
        "unit_cost",
        "order_quantity",
        "order_cost",
    ];

    fn push_bindings(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        let r = self.record;
        row.push_bind(self.run_id)
            .push_bind(r.project_id.clone())
            .push_bind(r.contract_id.clone())
            .push_bind(r.master_number.clone())
            .push_bind(r.date)
            .push_bind(month_key(r.date))
            .push_bind(r.item_id)
            .push_bind(r.unit_cost)
            .push_bind(r.order_quantity)
            .push_bind(r.order_cost);
    }
}

/// One value of an external data stream, such as a build rate.
///
/// Airframe mapping rows carry neither `date` nor `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExogenousFeature {
    pub periodic_data_stream: String,
    pub airframe: String,
    pub contract_id: String,
    pub project_id: String,
    pub date: Option<NaiveDate>,
    pub value: Option<f64>,
}

/// An exogenous feature tagged with the run that imported it, for bulk insert.
pub struct ExogenousRow<'a> {
    pub run_id: i64,
    pub record: &'a ExogenousFeature,
}

impl BulkRow for ExogenousRow<'_> {
    const TABLE: &'static str = tables::EXOGENOUS_FEATURE;
    const COLUMNS: &'static [&'static str] = &[
        "run_id",
        "periodic_data_stream",
        "airframe",
        "contract_id",
        "project_id",
        "date",
        "value",
    ];

    fn push_bindings(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        let r = self.record;
        row.push_bind(self.run_id)
            .push_bind(r.periodic_data_stream.clone())
            .push_bind(r.airframe.clone())
            .push_bind(r.contract_id.clone())
            .push_bind(r.project_id.clone())
            .push_bind(r.date)
            .push_bind(r.value);
    }
}

/// Identity of one forecast series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub contract_id: String,
    pub master_number: String,
    pub item_id: i64,
}

/// All cleaned records of one unit.
#[derive(Debug, Clone, Default)]
pub struct AccountData {
    pub unit: String,
    pub records: Vec<CleanedRecord>,
}

impl AccountData {
    pub fn new(unit: impl Into<String>, records: Vec<CleanedRecord>) -> Self {
        Self {
            unit: unit.into(),
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Monthly order quantities per series.
    pub fn monthly_series(&self) -> BTreeMap<SeriesKey, BTreeMap<NaiveDate, f64>> {
        let mut series: BTreeMap<SeriesKey, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        for record in &self.records {
            *series
                .entry(record.series_key())
                .or_default()
                .entry(record.date)
                .or_insert(0.0) += record.order_quantity;
        }
        series
    }

    /// Observed quantity of one series in one month, if any orders exist.
    pub fn actual(&self, key: &SeriesKey, month: NaiveDate) -> Option<f64> {
        let mut found = None;
        for record in self
            .records
            .iter()
            .filter(|r| r.date == month && r.item_id == key.item_id && r.contract_id == key.contract_id)
        {
            *found.get_or_insert(0.0) += record.order_quantity;
        }
        found
    }
}

/// Training history per series, ordered by month, with missing months filled with zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSet {
    pub series: BTreeMap<SeriesKey, Vec<f64>>,
    /// Months to forecast, first to last.
    pub horizon: Vec<NaiveDate>,
}

/// One forecast value.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub key: SeriesKey,
    pub month: NaiveDate,
    /// Months between the start of the forecast window and `month`.
    pub delta: u32,
    pub value: f64,
}

/// Forecast output of one stage, one point per series and month.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastFrame {
    pub points: Vec<ForecastPoint>,
}

impl ForecastFrame {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One row of `forecast_data` and of the per-unit result file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRecord {
    pub model_run_id: Option<i64>,
    pub contract_id: String,
    pub master_number: String,
    pub item_id: i64,
    pub prediction_start_month: NaiveDate,
    pub predicted_month: NaiveDate,
    pub prediction_months_delta: u32,
    pub prediction_raw: f64,
    pub prediction_post: f64,
    pub actual: Option<i64>,
    pub accuracy: Option<f64>,
}

impl BulkRow for ForecastRecord {
    const TABLE: &'static str = tables::FORECAST_DATA;
    const COLUMNS: &'static [&'static str] = &[
        "model_run_id",
        "contract_id",
        "item_id",
        "prediction_start_month",
        "predicted_month",
        "prediction_months_delta",
        "prediction_raw",
        "prediction_post",
        "actual",
        "accuracy",
    ];

    fn push_bindings(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.model_run_id)
            .push_bind(self.contract_id.clone())
            .push_bind(self.item_id)
            .push_bind(month_key(self.prediction_start_month))
            .push_bind(month_key(self.predicted_month))
            .push_bind(i64::from(self.prediction_months_delta))
            .push_bind(self.prediction_raw)
            .push_bind(self.prediction_post)
            .push_bind(self.actual)
            .push_bind(self.accuracy);
    }
}

pub const EXPORT_ELEMENT_TYPE: &str = "Forecast";
pub const EXPORT_ELEMENT: &str = "Additional Forecast 1";

/// One row of `forecast_export`, written by production runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub model_run_id: Option<i64>,
    pub item_name: String,
    pub period_date: NaiveDate,
    pub value: i64,
    pub new_item_flag: bool,
    pub created_at: DateTime<Utc>,
}

impl ExportRecord {
    pub fn from_forecast(record: &ForecastRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            model_run_id: record.model_run_id,
            item_name: format!(
                "Global|ContractID_Master_Part|{}|{}",
                record.contract_id, record.master_number
            ),
            period_date: record.predicted_month,
            value: record.prediction_post.round() as i64,
            new_item_flag: false,
            created_at,
        }
    }
}

impl BulkRow for ExportRecord {
    const TABLE: &'static str = tables::FORECAST_EXPORT;
    const COLUMNS: &'static [&'static str] = &[
        "model_run_id",
        "item_name",
        "period_date",
        "value",
        "element_type",
        "element",
        "new_item_flag",
        "created_at",
    ];

    fn push_bindings(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.model_run_id)
            .push_bind(self.item_name.clone())
            .push_bind(self.period_date)
            .push_bind(self.value)
            .push_bind(EXPORT_ELEMENT_TYPE)
            .push_bind(EXPORT_ELEMENT)
            .push_bind(self.new_item_flag)
            .push_bind(self.created_at);
    }
}

/// Forecast accuracy: `1 - |a - p| / max(a, p)`, and 1 when both agree.
pub fn accuracy(actual: f64, predicted: f64) -> f64 {
    if actual == predicted {
        return 1.0;
    }
    let denominator = actual.max(predicted);
    if denominator <= 0.0 {
        return 0.0;
    }
    1.0 - (actual - predicted).abs() / denominator
}
