//! Engine configuration.
//!
//! `EngineConfig` holds installation-wide settings: storage connection and
//! retry policy, default forecast horizon, parallelism ceiling, data and output
//! locations, and the catalog of forecast units. Values are resolved in layers:
//! built-in defaults, then an optional YAML file, then `FORECAST_*` environment
//! variables, and are validated once at the end.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or option has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {message}")]
    InvalidFile { path: String, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the execution engine isolates parallel workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Each worker is a child process of the current executable.
    #[default]
    Process,
    /// Each worker is a task inside the current process with its own context.
    Local,
}

impl FromStr for WorkerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(WorkerMode::Process),
            "local" => Ok(WorkerMode::Local),
            other => Err(ConfigError::InvalidValue {
                key: "worker_mode".to_string(),
                message: format!("expected 'process' or 'local', got '{}'", other),
            }),
        }
    }
}

/// Storage connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection string (e.g. "sqlite://forecast.db").
    pub url: String,
    /// Number of connection attempts; 0 disables the database entirely.
    pub connection_attempts: u32,
    /// Timeout for acquiring a connection and for busy waits.
    pub connection_timeout_secs: u64,
    /// Sleep between failed connection attempts.
    pub retry_sleep_ms: u64,
    /// Retries granted to read operations on transient errors.
    pub read_retries: u32,
    /// Sleep between read retries.
    pub read_retry_sleep_ms: u64,
    /// Rows committed per bulk-insert transaction.
    pub bulk_chunk_size: usize,
    /// Maximum pooled connections per process.
    pub max_connections: u32,
    /// Create the database file when it does not exist.
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://forecast.db".to_string(),
            connection_attempts: 5,
            connection_timeout_secs: 3,
            retry_sleep_ms: 3000,
            read_retries: 2,
            read_retry_sleep_ms: 1000,
            bulk_chunk_size: 10_000,
            max_connections: 4,
            create_if_missing: true,
        }
    }
}

impl DatabaseConfig {
    /// Creates a config pointing at the given SQLite file.
    pub fn sqlite_file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            ..Default::default()
        }
    }

    /// Creates a config with the database disabled.
    pub fn disabled() -> Self {
        Self {
            connection_attempts: 0,
            ..Default::default()
        }
    }

    /// Returns true when no connection should ever be attempted.
    pub fn is_disabled(&self) -> bool {
        self.connection_attempts == 0
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn read_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.read_retry_sleep_ms)
    }

    /// Sets the number of connection attempts.
    pub fn with_connection_attempts(mut self, attempts: u32) -> Self {
        self.connection_attempts = attempts;
        self
    }

    /// Sets the sleep between connection attempts.
    pub fn with_retry_sleep(mut self, sleep: Duration) -> Self {
        self.retry_sleep_ms = sleep.as_millis() as u64;
        self
    }

    /// Sets the read retry budget.
    pub fn with_read_retries(mut self, retries: u32, sleep: Duration) -> Self {
        self.read_retries = retries;
        self.read_retry_sleep_ms = sleep.as_millis() as u64;
        self
    }

    /// Sets the bulk insert chunk size.
    pub fn with_bulk_chunk_size(mut self, size: usize) -> Self {
        self.bulk_chunk_size = size;
        self
    }
}

/// One forecast unit (business account) from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unique unit name, used in logs, status records and output paths.
    pub name: String,
    /// Contracts whose cleaned data belongs to this unit.
    pub contracts: Vec<String>,
    /// Months of history averaged by the baseline model.
    #[serde(default = "default_lookback_months")]
    pub lookback_months: u32,
}

fn default_lookback_months() -> u32 {
    3
}

impl UnitConfig {
    pub fn new<I, S>(name: impl Into<String>, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            contracts: contracts.into_iter().map(Into::into).collect(),
            lookback_months: default_lookback_months(),
        }
    }

    /// Sets the lookback window of the baseline model.
    pub fn with_lookback_months(mut self, months: u32) -> Self {
        self.lookback_months = months;
        self
    }
}

/// Installation-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage settings.
    pub database: DatabaseConfig,
    /// Forecast horizon when none is given on the command line.
    pub default_forecast_periods: u32,
    /// Upper bound and default for unit parallelism.
    pub max_parallel_units: usize,
    /// How parallel workers are isolated.
    pub worker_mode: WorkerMode,
    /// Directory receiving per-run result folders.
    pub output_location: PathBuf,
    /// Directory holding raw input and file-based cleaned data.
    pub data_location: PathBuf,
    /// Catalog of forecast units.
    pub units: Vec<UnitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            default_forecast_periods: 13,
            max_parallel_units: 8,
            worker_mode: WorkerMode::Process,
            output_location: PathBuf::from("./output"),
            data_location: PathBuf::from("./data"),
            units: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional YAML file, then applies the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// environment variable holds an invalid value, or if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file; missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            ConfigError::InvalidFile { message, .. } => ConfigError::InvalidFile {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Parses YAML configuration content.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::InvalidFile {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Creates configuration from environment variables on top of defaults.
    ///
    /// # Environment Variables
    ///
    /// - `FORECAST_DATABASE_URL`: SQLite connection string (default: sqlite://forecast.db)
    /// - `FORECAST_DB_CONNECTION_ATTEMPTS`: Connection attempts, 0 disables storage (default: 5)
    /// - `FORECAST_DISABLE_DATABASE`: Boolean shortcut for zero connection attempts
    /// - `FORECAST_DB_RETRY_SLEEP_MS`: Sleep between connection attempts (default: 3000)
    /// - `FORECAST_DB_READ_RETRIES`: Read retries on transient errors (default: 2)
    /// - `FORECAST_DB_READ_RETRY_SLEEP_MS`: Sleep between read retries (default: 1000)
    /// - `FORECAST_DB_BULK_CHUNK_SIZE`: Rows per bulk insert transaction (default: 10000)
    /// - `FORECAST_DEFAULT_PERIODS`: Default forecast horizon in months (default: 13)
    /// - `FORECAST_MAX_PARALLEL_UNITS`: Parallelism ceiling (default: 8)
    /// - `FORECAST_WORKER_MODE`: `process` or `local` (default: process)
    /// - `FORECAST_OUTPUT_LOCATION`: Output directory (default: ./output)
    /// - `FORECAST_DATA_LOCATION`: Input data directory (default: ./data)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage settings
        if let Some(val) = lookup("FORECAST_DATABASE_URL") {
            self.database.url = val;
        }

        if let Some(val) = lookup("FORECAST_DB_CONNECTION_ATTEMPTS") {
            self.database.connection_attempts =
                parse_env_value(&val, "FORECAST_DB_CONNECTION_ATTEMPTS")?;
        }

        if let Some(val) = lookup("FORECAST_DISABLE_DATABASE") {
            if parse_env_bool(&val, "FORECAST_DISABLE_DATABASE")? {
                self.database.connection_attempts = 0;
            }
        }

        if let Some(val) = lookup("FORECAST_DB_RETRY_SLEEP_MS") {
            self.database.retry_sleep_ms = parse_env_value(&val, "FORECAST_DB_RETRY_SLEEP_MS")?;
        }

        if let Some(val) = lookup("FORECAST_DB_READ_RETRIES") {
            self.database.read_retries = parse_env_value(&val, "FORECAST_DB_READ_RETRIES")?;
        }

        if let Some(val) = lookup("FORECAST_DB_READ_RETRY_SLEEP_MS") {
            self.database.read_retry_sleep_ms =
                parse_env_value(&val, "FORECAST_DB_READ_RETRY_SLEEP_MS")?;
        }

        if let Some(val) = lookup("FORECAST_DB_BULK_CHUNK_SIZE") {
            self.database.bulk_chunk_size = parse_env_value(&val, "FORECAST_DB_BULK_CHUNK_SIZE")?;
        }

        // Run settings
        if let Some(val) = lookup("FORECAST_DEFAULT_PERIODS") {
            self.default_forecast_periods = parse_env_value(&val, "FORECAST_DEFAULT_PERIODS")?;
        }

        if let Some(val) = lookup("FORECAST_MAX_PARALLEL_UNITS") {
            self.max_parallel_units = parse_env_value(&val, "FORECAST_MAX_PARALLEL_UNITS")?;
        }

        if let Some(val) = lookup("FORECAST_WORKER_MODE") {
            self.worker_mode = val.parse()?;
        }

        // Locations
        if let Some(val) = lookup("FORECAST_OUTPUT_LOCATION") {
            self.output_location = PathBuf::from(val);
        }

        if let Some(val) = lookup("FORECAST_DATA_LOCATION") {
            self.data_location = PathBuf::from(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() && !self.database.is_disabled() {
            return Err(ConfigError::ValidationFailed(
                "database.url cannot be empty".to_string(),
            ));
        }

        if self.database.bulk_chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "database.bulk_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.default_forecast_periods == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_forecast_periods must be greater than 0".to_string(),
            ));
        }

        if self.max_parallel_units == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_units must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "unit names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(unit.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate unit name '{}'",
                    unit.name
                )));
            }
            if unit.lookback_months == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "unit '{}' lookback_months must be greater than 0",
                    unit.name
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the database configuration.
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Builder method to set the unit catalog.
    pub fn with_units(mut self, units: Vec<UnitConfig>) -> Self {
        self.units = units;
        self
    }

    /// Builder method to set the parallelism ceiling.
    pub fn with_max_parallel_units(mut self, max: usize) -> Self {
        self.max_parallel_units = max;
        self
    }

    /// Builder method to set the worker mode.
    pub fn with_worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = mode;
        self
    }

    /// Builder method to set the output location.
    pub fn with_output_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_location = path.into();
        self
    }

    /// Builder method to set the data location.
    pub fn with_data_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_location = path.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.database.connection_attempts, 5);
        assert_eq!(config.database.connection_timeout(), Duration::from_secs(3));
        assert_eq!(config.database.retry_sleep(), Duration::from_secs(3));
        assert_eq!(config.database.read_retries, 2);
        assert_eq!(config.database.read_retry_sleep(), Duration::from_secs(1));
        assert_eq!(config.database.bulk_chunk_size, 10_000);
        assert_eq!(config.default_forecast_periods, 13);
        assert_eq!(config.max_parallel_units, 8);
        assert_eq!(config.worker_mode, WorkerMode::Process);
        assert!(config.units.is_empty());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
database:
  url: "sqlite:///tmp/forecast.db"
  read_retries: 4
max_parallel_units: 3
worker_mode: local
units:
  - name: Account_1
    contracts: ["C1", "C2"]
  - name: Account_2
    contracts: ["C3"]
    lookback_months: 6
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.database.url, "sqlite:///tmp/forecast.db");
        assert_eq!(config.database.read_retries, 4);
        assert_eq!(config.database.connection_attempts, 5);
        assert_eq!(config.max_parallel_units, 3);
        assert_eq!(config.worker_mode, WorkerMode::Local);
        assert_eq!(config.units.len(), 2);
        assert_eq!(config.units[0].lookback_months, 3);
        assert_eq!(config.units[1].lookback_months, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let result = EngineConfig::from_yaml_str("max_parallel_units: [not, a, number]");
        assert!(matches!(result, Err(ConfigError::InvalidFile { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FORECAST_DB_CONNECTION_ATTEMPTS", "2"),
            ("FORECAST_MAX_PARALLEL_UNITS", "16"),
            ("FORECAST_WORKER_MODE", "local"),
            ("FORECAST_OUTPUT_LOCATION", "/srv/forecasts"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.connection_attempts, 2);
        assert_eq!(config.max_parallel_units, 16);
        assert_eq!(config.worker_mode, WorkerMode::Local);
        assert_eq!(config.output_location, PathBuf::from("/srv/forecasts"));
    }

    #[test]
    fn test_env_disable_database() {
        let mut config = EngineConfig::default();
        config
            .apply_env(|key| (key == "FORECAST_DISABLE_DATABASE").then(|| "yes".to_string()))
            .unwrap();
        assert!(config.database.is_disabled());
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = EngineConfig::default();
        let result = config.apply_env(|key| {
            (key == "FORECAST_DB_READ_RETRIES").then(|| "many".to_string())
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("FORECAST_DB_READ_RETRIES"));
    }

    #[test]
    fn test_validation_rejects_duplicate_units() {
        let config = EngineConfig::default().with_units(vec![
            UnitConfig::new("Account_1", ["C1"]),
            UnitConfig::new("Account_1", ["C2"]),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate unit name"));
    }

    #[test]
    fn test_validation_rejects_zero_parallelism() {
        let config = EngineConfig::default().with_max_parallel_units(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_parallel_units"));
    }

    #[test]
    fn test_disabled_database_config() {
        let config = DatabaseConfig::disabled();
        assert!(config.is_disabled());
        assert!(!DatabaseConfig::default().is_disabled());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_worker_mode_from_str() {
        assert_eq!("process".parse::<WorkerMode>().unwrap(), WorkerMode::Process);
        assert_eq!("Local".parse::<WorkerMode>().unwrap(), WorkerMode::Local);
        assert!("threads".parse::<WorkerMode>().is_err());
    }
}
