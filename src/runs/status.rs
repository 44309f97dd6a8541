//! Status vocabularies of runs and unit runs.
//!
//! The string forms are persisted and read by external tooling, so they are
//! part of the storage contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A status string that is not part of the vocabulary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Common behaviour of run and unit-run statuses.
pub trait StatusValue:
    Copy + Eq + fmt::Display + fmt::Debug + FromStr<Err = UnknownStatus> + Send + Sync + 'static
{
    /// Persisted string form.
    fn as_str(&self) -> &'static str;

    /// Terminal statuses admit no further transitions.
    fn is_terminal(&self) -> bool;
}

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initialized,
    Preprocess,
    RunModels,
    Cancelled,
    Completed,
    Failed,
}

impl StatusValue for RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "INITIALIZED",
            RunStatus::Preprocess => "PREPROCESS",
            RunStatus::RunModels => "RUN_MODELS",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Completed | RunStatus::Failed
        )
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(RunStatus::Initialized),
            "PREPROCESS" => Ok(RunStatus::Preprocess),
            "RUN_MODELS" => Ok(RunStatus::RunModels),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one unit's sub-run. Stage statuses mark the stage being entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitRunStatus {
    Initialized,
    LoadData,
    Preprocess,
    PrepareTraining,
    Forecast,
    Postprocess,
    Cancelled,
    Completed,
    Failed,
}

impl StatusValue for UnitRunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            UnitRunStatus::Initialized => "INITIALIZED",
            UnitRunStatus::LoadData => "LOAD_DATA",
            UnitRunStatus::Preprocess => "PREPROCESS",
            UnitRunStatus::PrepareTraining => "PREPARE_TRAINING",
            UnitRunStatus::Forecast => "FORECAST",
            UnitRunStatus::Postprocess => "POSTPROCESS",
            UnitRunStatus::Cancelled => "CANCELLED",
            UnitRunStatus::Completed => "COMPLETED",
            UnitRunStatus::Failed => "FAILED",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitRunStatus::Cancelled | UnitRunStatus::Completed | UnitRunStatus::Failed
        )
    }
}

impl FromStr for UnitRunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(UnitRunStatus::Initialized),
            "LOAD_DATA" => Ok(UnitRunStatus::LoadData),
            "PREPROCESS" => Ok(UnitRunStatus::Preprocess),
            "PREPARE_TRAINING" => Ok(UnitRunStatus::PrepareTraining),
            "FORECAST" => Ok(UnitRunStatus::Forecast),
            "POSTPROCESS" => Ok(UnitRunStatus::Postprocess),
            "CANCELLED" => Ok(UnitRunStatus::Cancelled),
            "COMPLETED" => Ok(UnitRunStatus::Completed),
            "FAILED" => Ok(UnitRunStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for UnitRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL list of terminal status strings, for `NOT IN (...)` filters.
pub const TERMINAL_STATUS_SQL: &str = "('CANCELLED', 'COMPLETED', 'FAILED')";

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RUN: [RunStatus; 6] = [
        RunStatus::Initialized,
        RunStatus::Preprocess,
        RunStatus::RunModels,
        RunStatus::Cancelled,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    const ALL_UNIT: [UnitRunStatus; 9] = [
        UnitRunStatus::Initialized,
        UnitRunStatus::LoadData,
        UnitRunStatus::Preprocess,
        UnitRunStatus::PrepareTraining,
        UnitRunStatus::Forecast,
        UnitRunStatus::Postprocess,
        UnitRunStatus::Cancelled,
        UnitRunStatus::Completed,
        UnitRunStatus::Failed,
    ];

    #[test]
    fn test_run_status_strings() {
        let strings: Vec<_> = ALL_RUN.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            strings,
            vec!["INITIALIZED", "PREPROCESS", "RUN_MODELS", "CANCELLED", "COMPLETED", "FAILED"]
        );
        for status in ALL_RUN {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unit_status_strings() {
        for status in ALL_UNIT {
            assert_eq!(status.to_string().parse::<UnitRunStatus>().unwrap(), status);
        }
        assert_eq!(UnitRunStatus::PrepareTraining.as_str(), "PREPARE_TRAINING");
        assert!("RUN_MODELS".parse::<UnitRunStatus>().is_err());
    }

    #[test]
    fn test_terminal_sets() {
        let terminal: Vec<_> = ALL_RUN.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![&RunStatus::Cancelled, &RunStatus::Completed, &RunStatus::Failed]
        );

        let terminal = ALL_UNIT.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(terminal, 3);
    }

    #[test]
    fn test_serde_matches_persisted_strings() {
        let json = serde_json::to_string(&UnitRunStatus::LoadData).unwrap();
        assert_eq!(json, "\"LOAD_DATA\"");
        let status: RunStatus = serde_json::from_str("\"RUN_MODELS\"").unwrap();
        assert_eq!(status, RunStatus::RunModels);
    }

    #[test]
    fn test_unknown_status() {
        let err = "DONE".parse::<RunStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("DONE".to_string()));
        assert!(err.to_string().contains("DONE"));
    }
}
