//! Per-invocation run configuration.
//!
//! A `RunConfig` is resolved once from the engine defaults and the explicit
//! parameters of one invocation. It is shared read-only (behind an `Arc`) by
//! every component of the run and shipped verbatim to worker processes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::config::{ConfigError, DatabaseConfig, EngineConfig, UnitConfig, WorkerMode};

/// Month format used for prediction months on the command line and in outputs.
pub const PREDICTION_MONTH_FORMAT: &str = "%Y%m";

/// Direction and destination semantics of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineRunType {
    /// Forward forecast stored in files and the internal tables.
    #[default]
    Development,
    /// Forward forecast additionally exported for downstream consumers.
    Production,
    /// Backtest over past months, stored in files only.
    Backward,
}

impl EngineRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineRunType::Development => "development",
            EngineRunType::Production => "production",
            EngineRunType::Backward => "backward",
        }
    }
}

impl fmt::Display for EngineRunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineRunType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(EngineRunType::Development),
            "production" => Ok(EngineRunType::Production),
            "backward" => Ok(EngineRunType::Backward),
            other => Err(ConfigError::InvalidValue {
                key: "run_type".to_string(),
                message: format!("unknown run type '{}'", other),
            }),
        }
    }
}

/// Explicit parameters of one invocation; unset values fall back to engine defaults.
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    pub run_type: EngineRunType,
    pub forecast_periods: Option<u32>,
    pub prediction_month: Option<NaiveDate>,
    pub output_location: Option<PathBuf>,
    pub only_unit: Option<String>,
    pub exclude_unit: Option<String>,
    pub force_reload: bool,
    pub parallelism: Option<usize>,
}

impl RunParameters {
    pub fn new(run_type: EngineRunType) -> Self {
        Self {
            run_type,
            ..Default::default()
        }
    }

    pub fn with_forecast_periods(mut self, periods: u32) -> Self {
        self.forecast_periods = Some(periods);
        self
    }

    pub fn with_prediction_month(mut self, month: NaiveDate) -> Self {
        self.prediction_month = Some(month);
        self
    }

    pub fn with_output_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_location = Some(path.into());
        self
    }

    pub fn with_only_unit(mut self, unit: impl Into<String>) -> Self {
        self.only_unit = Some(unit.into());
        self
    }

    pub fn with_exclude_unit(mut self, unit: impl Into<String>) -> Self {
        self.exclude_unit = Some(unit.into());
        self
    }

    pub fn with_force_reload(mut self, force: bool) -> Self {
        self.force_reload = force;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }
}

/// Immutable snapshot of everything a run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_type: EngineRunType,
    /// Whether this run imports and cleans raw input before forecasting.
    pub includes_cleaning: bool,
    pub forecast_periods: u32,
    /// First forecast month for forward runs, last forecast month for backward runs.
    pub prediction_month: NaiveDate,
    pub test_periods: u32,
    pub predict_periods: u32,
    pub forecast_start: NaiveDate,
    pub forecast_end: NaiveDate,
    pub units: Vec<UnitConfig>,
    pub parallelism: usize,
    pub worker_mode: WorkerMode,
    pub database: DatabaseConfig,
    /// Directory of this run's result files.
    pub output_dir: PathBuf,
    pub data_location: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl RunConfig {
    /// Resolves a run configuration at the current time.
    pub fn new(engine: &EngineConfig, params: RunParameters) -> Result<Self, ConfigError> {
        Self::resolve(engine, params, Utc::now())
    }

    /// Resolves a run configuration as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when unit filters conflict or name unknown units,
    /// when no unit remains, or when periods or parallelism are zero.
    pub fn resolve(
        engine: &EngineConfig,
        params: RunParameters,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let run_type = params.run_type;
        let forecast_periods = params
            .forecast_periods
            .unwrap_or(engine.default_forecast_periods);
        if forecast_periods == 0 {
            return Err(ConfigError::ValidationFailed(
                "forecast_periods must be greater than 0".to_string(),
            ));
        }
        let periods = i32::try_from(forecast_periods).map_err(|_| {
            ConfigError::ValidationFailed(format!(
                "forecast_periods {} is too large",
                forecast_periods
            ))
        })?;

        let prediction_month = match params.prediction_month {
            Some(month) => month_start(month),
            None => default_prediction_month(run_type, now.date_naive())?,
        };

        let (test_periods, predict_periods) = match run_type {
            EngineRunType::Backward => (forecast_periods, 0),
            _ => (0, forecast_periods),
        };

        let forecast_start = match run_type {
            EngineRunType::Backward => shift_months(prediction_month, 1 - periods)?,
            _ => prediction_month,
        };
        let forecast_end = shift_months(forecast_start, periods - 1)?;

        let units = select_units(
            &engine.units,
            params.only_unit.as_deref(),
            params.exclude_unit.as_deref(),
        )?;

        let parallelism = params
            .parallelism
            .unwrap_or(engine.max_parallel_units)
            .min(engine.max_parallel_units);
        if parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "parallelism must be greater than 0".to_string(),
            ));
        }

        let output_location = params
            .output_location
            .unwrap_or_else(|| engine.output_location.clone());
        let output_dir = output_location.join(format!(
            "{}_{}_{}",
            run_type,
            format_month(prediction_month),
            now.format("%Y%m%d%H%M%S")
        ));

        Ok(Self {
            run_type,
            includes_cleaning: run_type != EngineRunType::Backward || params.force_reload,
            forecast_periods,
            prediction_month,
            test_periods,
            predict_periods,
            forecast_start,
            forecast_end,
            units,
            parallelism,
            worker_mode: engine.worker_mode,
            database: engine.database.clone(),
            output_dir,
            data_location: engine.data_location.clone(),
            created_at: now,
        })
    }

    /// All months of the forecast window, first to last.
    pub fn forecast_months(&self) -> Vec<NaiveDate> {
        (0..self.forecast_periods)
            .filter_map(|offset| self.forecast_start.checked_add_months(Months::new(offset)))
            .collect()
    }

    /// Directory receiving the result files of one unit.
    pub fn unit_output_dir(&self, unit: &str) -> PathBuf {
        self.output_dir.join(unit)
    }
}

fn select_units(
    catalog: &[UnitConfig],
    only: Option<&str>,
    exclude: Option<&str>,
) -> Result<Vec<UnitConfig>, ConfigError> {
    if only.is_some() && exclude.is_some() {
        return Err(ConfigError::ValidationFailed(
            "only_unit and exclude_unit cannot be combined".to_string(),
        ));
    }

    for name in only.iter().chain(exclude.iter()) {
        if !catalog.iter().any(|u| u.name == *name) {
            return Err(ConfigError::InvalidValue {
                key: "unit".to_string(),
                message: format!("unknown unit '{}'", name),
            });
        }
    }

    let units: Vec<UnitConfig> = catalog
        .iter()
        .filter(|u| only.map_or(true, |name| u.name == name))
        .filter(|u| exclude.map_or(true, |name| u.name != name))
        .cloned()
        .collect();

    if units.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "no units selected for this run".to_string(),
        ));
    }
    Ok(units)
}

fn default_prediction_month(
    run_type: EngineRunType,
    today: NaiveDate,
) -> Result<NaiveDate, ConfigError> {
    let current = month_start(today);
    match run_type {
        EngineRunType::Backward => shift_months(current, -1),
        _ => Ok(current),
    }
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Moves a date by a signed number of months.
pub fn shift_months(date: NaiveDate, months: i32) -> Result<NaiveDate, ConfigError> {
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted.ok_or_else(|| ConfigError::InvalidValue {
        key: "prediction_month".to_string(),
        message: format!("{} shifted by {} months is out of range", date, months),
    })
}

/// Parses a `YYYYMM` month.
pub fn parse_month(value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(&format!("{}01", value.trim()), "%Y%m%d").map_err(|_| {
        ConfigError::InvalidValue {
            key: "prediction_month".to_string(),
            message: format!("expected YYYYMM, got '{}'", value),
        }
    })
}

/// Formats a month as `YYYYMM`.
pub fn format_month(date: NaiveDate) -> String {
    date.format(PREDICTION_MONTH_FORMAT).to_string()
}

/// Integer `YYYYMM` key used in storage.
pub fn month_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 100 + date.month() as i64
}

/// Inverse of [`month_key`].
pub fn month_from_key(key: i64) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((key / 100) as i32, (key % 100) as u32, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> EngineConfig {
        EngineConfig::default().with_units(vec![
            UnitConfig::new("Account_1", ["C1"]),
            UnitConfig::new("Account_2", ["C2"]),
            UnitConfig::new("Account_3", ["C3"]),
        ])
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 5, 17, 8, 30, 0).unwrap()
    }

    fn ymd(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    #[test]
    fn test_forward_window() {
        let params = RunParameters::new(EngineRunType::Development)
            .with_prediction_month(ymd(2020, 2))
            .with_forecast_periods(13);
        let config = RunConfig::resolve(&engine(), params, now()).unwrap();

        assert!(config.includes_cleaning);
        assert_eq!(config.test_periods, 0);
        assert_eq!(config.predict_periods, 13);
        assert_eq!(config.forecast_start, ymd(2020, 2));
        assert_eq!(config.forecast_end, ymd(2021, 2));
        assert_eq!(config.forecast_months().len(), 13);
    }

    #[test]
    fn test_backward_window_walks_back_from_end() {
        let params = RunParameters::new(EngineRunType::Backward)
            .with_prediction_month(ymd(2020, 2))
            .with_forecast_periods(3);
        let config = RunConfig::resolve(&engine(), params, now()).unwrap();

        assert!(!config.includes_cleaning);
        assert_eq!(config.test_periods, 3);
        assert_eq!(config.predict_periods, 0);
        assert_eq!(config.forecast_start, ymd(2019, 12));
        assert_eq!(config.forecast_end, ymd(2020, 2));
    }

    #[test]
    fn test_backward_force_reload_includes_cleaning() {
        let params = RunParameters::new(EngineRunType::Backward).with_force_reload(true);
        let config = RunConfig::resolve(&engine(), params, now()).unwrap();
        assert!(config.includes_cleaning);
    }

    #[test]
    fn test_default_prediction_month() {
        let forward = RunConfig::resolve(
            &engine(),
            RunParameters::new(EngineRunType::Production),
            now(),
        )
        .unwrap();
        assert_eq!(forward.prediction_month, ymd(2020, 5));

        let backward =
            RunConfig::resolve(&engine(), RunParameters::new(EngineRunType::Backward), now())
                .unwrap();
        assert_eq!(backward.prediction_month, ymd(2020, 4));
    }

    #[test]
    fn test_prediction_month_normalized_to_first_day() {
        let params = RunParameters::new(EngineRunType::Development)
            .with_prediction_month(NaiveDate::from_ymd_opt(2020, 7, 23).unwrap());
        let config = RunConfig::resolve(&engine(), params, now()).unwrap();
        assert_eq!(config.prediction_month, ymd(2020, 7));
    }

    #[test]
    fn test_unit_filters() {
        let only = RunParameters::new(EngineRunType::Development).with_only_unit("Account_2");
        let config = RunConfig::resolve(&engine(), only, now()).unwrap();
        assert_eq!(config.units.len(), 1);
        assert_eq!(config.units[0].name, "Account_2");

        let exclude = RunParameters::new(EngineRunType::Development).with_exclude_unit("Account_2");
        let config = RunConfig::resolve(&engine(), exclude, now()).unwrap();
        let names: Vec<_> = config.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Account_1", "Account_3"]);
    }

    #[test]
    fn test_unit_filters_conflict() {
        let params = RunParameters::new(EngineRunType::Development)
            .with_only_unit("Account_1")
            .with_exclude_unit("Account_2");
        let err = RunConfig::resolve(&engine(), params, now()).unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let params = RunParameters::new(EngineRunType::Development).with_only_unit("Nope");
        let err = RunConfig::resolve(&engine(), params, now()).unwrap_err();
        assert!(err.to_string().contains("unknown unit 'Nope'"));
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let result = RunConfig::resolve(
            &EngineConfig::default(),
            RunParameters::new(EngineRunType::Development),
            now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_periods_rejected() {
        let params = RunParameters::new(EngineRunType::Development).with_forecast_periods(0);
        assert!(RunConfig::resolve(&engine(), params, now()).is_err());
    }

    #[test]
    fn test_oversized_periods_rejected() {
        for run_type in [EngineRunType::Backward, EngineRunType::Development] {
            let params = RunParameters::new(run_type).with_forecast_periods(u32::MAX);
            let err = RunConfig::resolve(&engine(), params, now()).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationFailed(_)));
        }

        let params = RunParameters::new(EngineRunType::Backward).with_forecast_periods(1 << 31);
        assert!(RunConfig::resolve(&engine(), params, now()).is_err());
    }

    #[test]
    fn test_parallelism_capped_by_engine() {
        let engine = engine().with_max_parallel_units(4);
        let params = RunParameters::new(EngineRunType::Development).with_parallelism(32);
        let config = RunConfig::resolve(&engine, params, now()).unwrap();
        assert_eq!(config.parallelism, 4);

        let params = RunParameters::new(EngineRunType::Development).with_parallelism(0);
        assert!(RunConfig::resolve(&engine, params, now()).is_err());
    }

    #[test]
    fn test_output_dir_naming() {
        let params = RunParameters::new(EngineRunType::Backward)
            .with_prediction_month(ymd(2020, 2))
            .with_output_location("/tmp/out");
        let config = RunConfig::resolve(&engine(), params, now()).unwrap();
        assert_eq!(
            config.output_dir,
            PathBuf::from("/tmp/out/backward_202002_20200517083000")
        );
        assert_eq!(
            config.unit_output_dir("Account_1"),
            PathBuf::from("/tmp/out/backward_202002_20200517083000/Account_1")
        );
    }

    #[test]
    fn test_month_helpers() {
        assert_eq!(parse_month("202002").unwrap(), ymd(2020, 2));
        assert!(parse_month("2020-02").is_err());
        assert!(parse_month("202013").is_err());
        assert_eq!(format_month(ymd(2019, 11)), "201911");
        assert_eq!(month_key(ymd(2019, 11)), 201911);
        assert_eq!(month_from_key(201911), Some(ymd(2019, 11)));
        assert_eq!(shift_months(ymd(2020, 1), -1).unwrap(), ymd(2019, 12));
    }

    #[test]
    fn test_run_type_round_trip() {
        for run_type in [
            EngineRunType::Development,
            EngineRunType::Production,
            EngineRunType::Backward,
        ] {
            assert_eq!(run_type.to_string().parse::<EngineRunType>().unwrap(), run_type);
        }
        assert!("sideways".parse::<EngineRunType>().is_err());
    }
}
