//! Job definitions for the execution engine.
//!
//! This module defines the plain data exchanged with workers:
//!
//! - `UnitJob`: one unit to run, plus the arguments shared by every unit of the run
//! - `UnitFailure`: serializable summary of a failed unit
//! - `WorkerRequest` / `WorkerReply`: the JSON-lines protocol of worker processes

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DataError, ForecastError};
use crate::pipeline::{RunConfig, UnitConfig};

/// Arguments shared by every unit of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedArgs {
    /// Owning run, `None` when storage is disabled.
    pub run_id: Option<i64>,
    /// Run whose cleaned data the units forecast from.
    pub cleaned_data_run_id: Option<i64>,
    /// Newest month present in the cleaned data.
    pub newest_month: NaiveDate,
    pub run_config: RunConfig,
}

/// One unit submitted to the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitJob {
    /// Position in submission order.
    pub index: usize,
    pub unit: UnitConfig,
    pub args: SharedArgs,
}

impl UnitJob {
    pub fn new(index: usize, unit: UnitConfig, args: SharedArgs) -> Self {
        Self { index, unit, args }
    }
}

/// Coarse classification of a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Account data was empty.
    EmptyData,
    Data,
    Database,
    Config,
    Cancelled,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::EmptyData => "empty_data",
            FailureKind::Data => "data",
            FailureKind::Database => "database",
            FailureKind::Config => "config",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Serializable summary of a unit that failed inside a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: String,
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    pub fn from_error(unit: impl Into<String>, error: &ForecastError) -> Self {
        let kind = match error {
            ForecastError::Data(DataError::EmptyData { .. }) => FailureKind::EmptyData,
            ForecastError::Data(_) => FailureKind::Data,
            ForecastError::Database(_) => FailureKind::Database,
            ForecastError::Config(_) => FailureKind::Config,
            ForecastError::Cancelled => FailureKind::Cancelled,
            ForecastError::UnitFailed(failure) => failure.kind,
            _ => FailureKind::Other,
        };
        let message = match error {
            ForecastError::UnitFailed(failure) => failure.message.clone(),
            other => other.to_string(),
        };
        Self {
            unit: unit.into(),
            kind,
            message,
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit '{}' failed ({}): {}", self.unit, self.kind, self.message)
    }
}

/// A message from the parent to a worker process, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Run { job: UnitJob },
    Shutdown,
}

/// A worker's answer to one `Run` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub index: usize,
    pub unit: String,
    pub outcome: Result<(), UnitFailure>,
}

impl WorkerReply {
    pub fn from_result(job: &UnitJob, result: &Result<(), ForecastError>) -> Self {
        Self {
            index: job.index,
            unit: job.unit.name.clone(),
            outcome: result
                .as_ref()
                .map(|_| ())
                .map_err(|e| UnitFailure::from_error(job.unit.name.clone(), e)),
        }
    }

    /// Converts the reply back into an engine outcome.
    pub fn into_result(self) -> Result<(), ForecastError> {
        self.outcome.map_err(ForecastError::UnitFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EngineConfig, EngineRunType, RunParameters};

    fn job() -> UnitJob {
        let engine = EngineConfig::default().with_units(vec![UnitConfig::new("Account_1", ["C1"])]);
        let config = RunConfig::new(&engine, RunParameters::new(EngineRunType::Backward)).unwrap();
        UnitJob::new(
            0,
            config.units[0].clone(),
            SharedArgs {
                run_id: Some(3),
                cleaned_data_run_id: Some(2),
                newest_month: config.prediction_month,
                run_config: config,
            },
        )
    }

    #[test]
    fn test_request_wire_format() {
        let line = serde_json::to_string(&WorkerRequest::Shutdown).unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);

        let request = WorkerRequest::Run { job: job() };
        let line = serde_json::to_string(&request).unwrap();
        assert!(!line.contains('\n'));
        let parsed: WorkerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_failure_classification() {
        let err = ForecastError::Data(DataError::EmptyData {
            unit: "Account_1".to_string(),
        });
        let failure = UnitFailure::from_error("Account_1", &err);
        assert_eq!(failure.kind, FailureKind::EmptyData);
        assert_eq!(failure.message, "Data error: Account data empty for unit 'Account_1'");
        assert!(failure.to_string().contains("empty_data"));

        let nested = UnitFailure::from_error("Account_1", &ForecastError::UnitFailed(failure.clone()));
        assert_eq!(nested, failure);
    }

    #[test]
    fn test_reply_round_trip() {
        let job = job();
        let ok = WorkerReply::from_result(&job, &Ok(()));
        assert!(ok.into_result().is_ok());

        let failed = WorkerReply::from_result(&job, &Err(ForecastError::Cancelled));
        let line = serde_json::to_string(&failed).unwrap();
        let parsed: WorkerReply = serde_json::from_str(&line).unwrap();
        match parsed.into_result() {
            Err(ForecastError::UnitFailed(failure)) => {
                assert_eq!(failure.kind, FailureKind::Cancelled);
                assert_eq!(failure.unit, "Account_1");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
