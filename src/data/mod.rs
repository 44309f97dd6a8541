//! Account data: import and cleaning, loading, result output and
//! reconciliation of historical actuals.
//!
//! # Overview
//!
//! - **cleaning**: the [`CleaningSource`] collaborator that loads, validates
//!   and cleans raw order input and loads exogenous features.
//! - **loader**: [`DataLoader`] reads one unit's cleaned data under the read
//!   retry policy, or from processed files when storage is disabled.
//! - **output**: [`DataOutput`] stores cleaned data and exogenous features and implements
//!   [`ResultWriter`], choosing destinations by run kind.
//! - **reconcile**: [`Reconciler`] picks the cleaned data a run uses and
//!   back-fills actuals of stored forecasts.

pub mod cleaning;
pub mod loader;
pub mod output;
pub mod reconcile;
pub mod records;

pub use cleaning::{
    clean_records, validate_records, CleaningSource, CsvCleaningSource, EXOGENOUS_INPUT_FILE,
    RAW_INPUT_FILE,
};
pub use loader::{processed_data_path, processed_exogenous_path, DataLoader};
pub use output::{months_between, DataOutput, ResultWriter, RESULT_FILE};
pub use reconcile::Reconciler;
pub use records::{
    accuracy, AccountData, CleanedRecord, CleanedRow, ExogenousFeature, ExogenousRow, ExportRecord,
    ForecastFrame, ForecastPoint, ForecastRecord, RawRecord, SeriesKey, TrainingSet,
};
