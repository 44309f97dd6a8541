//! Database schema constants.
//!
//! SQLite schema for run tracking, cleaned input data and forecast results.
//! Timestamps are stored as RFC 3339 text, months as `YYYYMM` integers.

/// Table of pipeline invocations.
pub const CREATE_FORECAST_RUN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS forecast_run (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_type TEXT NOT NULL,
    includes_cleaning INTEGER NOT NULL,
    forecast_periods INTEGER NOT NULL,
    prediction_start_month INTEGER NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT
)
"#;

/// Table of per-unit sub-runs.
pub const CREATE_FORECAST_MODEL_RUN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS forecast_model_run (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES forecast_run(id),
    model_name TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT
)
"#;

/// Cleaned input data, tagged with the run that produced it.
pub const CREATE_CLEANED_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cleaned_data (
    run_id INTEGER NOT NULL,
    project_id TEXT NOT NULL,
    contract_id TEXT NOT NULL,
    master_number TEXT NOT NULL,
    date TEXT NOT NULL,
    date_yyyymm INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    unit_cost REAL NOT NULL,
    order_quantity REAL NOT NULL,
    order_cost REAL NOT NULL
)
"#;

/// Forecast results per unit run.
pub const CREATE_FORECAST_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS forecast_data (
    model_run_id INTEGER NOT NULL REFERENCES forecast_model_run(id),
    contract_id TEXT NOT NULL,
    item_id INTEGER NOT NULL,
    prediction_start_month INTEGER NOT NULL,
    predicted_month INTEGER NOT NULL,
    prediction_months_delta INTEGER NOT NULL,
    prediction_raw REAL NOT NULL,
    prediction_post REAL NOT NULL,
    actual INTEGER,
    accuracy REAL,
    PRIMARY KEY (model_run_id, contract_id, item_id, prediction_start_month, predicted_month)
)
"#;

/// Forecast rows exported for downstream planning by production runs.
pub const CREATE_FORECAST_EXPORT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS forecast_export (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_run_id INTEGER NOT NULL REFERENCES forecast_model_run(id),
    item_name TEXT NOT NULL,
    period_date TEXT NOT NULL,
    value INTEGER NOT NULL,
    element_type TEXT NOT NULL,
    element TEXT NOT NULL,
    new_item_flag INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
)
"#;

/// External time series (build rates, airframe mappings) imported with the cleaned data.
/// `date` and `value` are NULL for airframe rows.
pub const CREATE_EXOGENOUS_FEATURE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS exogenous_feature (
    run_id INTEGER NOT NULL,
    periodic_data_stream TEXT NOT NULL,
    airframe TEXT NOT NULL,
    contract_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    date TEXT,
    value REAL
)
"#;

pub const CREATE_FORECAST_RUN_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_forecast_run_status ON forecast_run(status)";

pub const CREATE_MODEL_RUN_RUN_ID_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_forecast_model_run_run_id ON forecast_model_run(run_id)";

pub const CREATE_CLEANED_DATA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_cleaned_data_run_contract ON cleaned_data(run_id, contract_id)";

pub const CREATE_EXOGENOUS_FEATURE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_exogenous_feature_run_stream ON exogenous_feature(run_id, periodic_data_stream)";

/// Returns all schema creation statements in the correct order.
///
/// Migrations are named by position, so new statements go at the end.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_FORECAST_RUN_TABLE,
        CREATE_FORECAST_MODEL_RUN_TABLE,
        CREATE_CLEANED_DATA_TABLE,
        CREATE_FORECAST_DATA_TABLE,
        CREATE_FORECAST_EXPORT_TABLE,
        CREATE_FORECAST_RUN_STATUS_INDEX,
        CREATE_MODEL_RUN_RUN_ID_INDEX,
        CREATE_CLEANED_DATA_INDEX,
        CREATE_EXOGENOUS_FEATURE_TABLE,
        CREATE_EXOGENOUS_FEATURE_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const FORECAST_RUN: &str = "forecast_run";
    pub const FORECAST_MODEL_RUN: &str = "forecast_model_run";
    pub const CLEANED_DATA: &str = "cleaned_data";
    pub const FORECAST_DATA: &str = "forecast_data";
    pub const FORECAST_EXPORT: &str = "forecast_export";
    pub const EXOGENOUS_FEATURE: &str = "exogenous_feature";

    /// All tables, parents first.
    pub const ALL: [&str; 6] = [
        FORECAST_RUN,
        FORECAST_MODEL_RUN,
        CLEANED_DATA,
        FORECAST_DATA,
        FORECAST_EXPORT,
        EXOGENOUS_FEATURE,
    ];
}
