//! Import and cleaning of raw order input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::DataError;
use crate::pipeline::month_start;

use super::records::{CleanedRecord, ExogenousFeature, RawRecord};

/// File name of the raw order input below the data location.
pub const RAW_INPUT_FILE: &str = "raw_input.csv";

/// File name of the exogenous feature input below the data location.
pub const EXOGENOUS_INPUT_FILE: &str = "exogenous_input.csv";

/// Source of the cleaning phase: loads raw input, validates it and cleans it.
///
/// The exogenous features are imported alongside and stored unchanged.
#[async_trait]
pub trait CleaningSource: Send + Sync {
    async fn load_raw_input(&self) -> Result<Vec<RawRecord>, DataError>;

    /// Loads the exogenous feature input. Empty input is an error.
    async fn load_exogenous_features(&self) -> Result<Vec<ExogenousFeature>, DataError>;

    fn validate(&self, raw: &[RawRecord]) -> Result<(), DataError>;

    fn clean(&self, raw: Vec<RawRecord>) -> Vec<CleanedRecord>;
}

/// Reads raw orders from `<data_location>/raw_input.csv` and exogenous
/// features from `<data_location>/exogenous_input.csv`.
#[derive(Debug, Clone)]
pub struct CsvCleaningSource {
    path: PathBuf,
    exogenous_path: PathBuf,
}

impl CsvCleaningSource {
    pub fn new(data_location: impl AsRef<Path>) -> Self {
        Self {
            path: data_location.as_ref().join(RAW_INPUT_FILE),
            exogenous_path: data_location.as_ref().join(EXOGENOUS_INPUT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exogenous_path(&self) -> &Path {
        &self.exogenous_path
    }
}

#[async_trait]
impl CleaningSource for CsvCleaningSource {
    async fn load_raw_input(&self) -> Result<Vec<RawRecord>, DataError> {
        let records: Vec<RawRecord> = read_csv_input(&self.path).await?;
        info!(path = %self.path.display(), rows = records.len(), "Loaded raw input");
        Ok(records)
    }

    async fn load_exogenous_features(&self) -> Result<Vec<ExogenousFeature>, DataError> {
        let features: Vec<ExogenousFeature> = read_csv_input(&self.exogenous_path).await?;
        if features.is_empty() {
            return Err(DataError::EmptyExogenousInput);
        }
        info!(
            path = %self.exogenous_path.display(),
            rows = features.len(),
            "Loaded exogenous feature input"
        );
        Ok(features)
    }

    fn validate(&self, raw: &[RawRecord]) -> Result<(), DataError> {
        validate_records(raw)
    }

    fn clean(&self, raw: Vec<RawRecord>) -> Vec<CleanedRecord> {
        clean_records(raw)
    }
}

/// Deserializes every row of a CSV input file.
pub(crate) async fn read_csv_input<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, DataError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DataError::MissingInput(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let rows = reader.deserialize::<T>().collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rejects empty input and rows with blank identifiers or negative amounts.
///
/// Row numbers in errors are 1-based data rows.
pub fn validate_records(raw: &[RawRecord]) -> Result<(), DataError> {
    if raw.is_empty() {
        return Err(DataError::EmptyInput);
    }

    for (index, record) in raw.iter().enumerate() {
        let row = index + 1;
        if record.contract_id.trim().is_empty() {
            return Err(DataError::InvalidRecord {
                row,
                message: "contract_id is empty".to_string(),
            });
        }
        if !record.order_quantity.is_finite() || record.order_quantity < 0.0 {
            return Err(DataError::InvalidRecord {
                row,
                message: format!("order_quantity {} is negative", record.order_quantity),
            });
        }
        if !record.unit_cost.is_finite() || record.unit_cost < 0.0 {
            return Err(DataError::InvalidRecord {
                row,
                message: format!("unit_cost {} is negative", record.unit_cost),
            });
        }
    }
    Ok(())
}

type CleaningKey = (String, String, String, i64, NaiveDate);

/// Aggregates order lines to one record per project, contract, item and month.
///
/// Quantities and costs are summed; the unit cost of an aggregate is its
/// quantity-weighted average.
pub fn clean_records(raw: Vec<RawRecord>) -> Vec<CleanedRecord> {
    let input_rows = raw.len();
    let mut groups: BTreeMap<CleaningKey, (f64, f64, f64)> = BTreeMap::new();

    for record in raw {
        let key = (
            record.project_id,
            record.contract_id,
            record.master_number,
            record.item_id,
            month_start(record.date),
        );
        let entry = groups.entry(key).or_insert((0.0, 0.0, record.unit_cost));
        entry.0 += record.order_quantity;
        entry.1 += record.order_quantity * record.unit_cost;
    }

    let cleaned: Vec<CleanedRecord> = groups
        .into_iter()
        .map(
            |((project_id, contract_id, master_number, item_id, date), (quantity, cost, first_cost))| {
                CleanedRecord {
                    project_id,
                    contract_id,
                    master_number,
                    date,
                    item_id,
                    unit_cost: if quantity > 0.0 { cost / quantity } else { first_cost },
                    order_quantity: quantity,
                    order_cost: cost,
                }
            },
        )
        .collect();

    debug!(input_rows, cleaned_rows = cleaned.len(), "Cleaned raw input");
    cleaned
}
