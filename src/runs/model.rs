//! Run and unit-run entities and the guarded status transition.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pipeline::{EngineRunType, RunConfig};

use super::status::{RunStatus, StatusValue, UnitRunStatus};

/// An entity whose status moves through a guarded state machine.
pub trait Tracked {
    type Status: StatusValue;

    /// Storage identifier, `None` until persisted.
    fn id(&self) -> Option<i64>;
    fn status(&self) -> Self::Status;
    fn end(&self) -> Option<DateTime<Utc>>;
    /// Short label used in log records.
    fn label(&self) -> String;

    fn set_status(&mut self, status: Self::Status);
    fn set_end(&mut self, end: DateTime<Utc>);

    fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Applies a status change unless the entity is already terminal.
///
/// A terminal entity is returned unchanged with a warning. Entering a terminal
/// status stamps the end time. Stage order is not enforced.
pub fn transition<E: Tracked>(mut entity: E, status: E::Status) -> E {
    if entity.is_terminal() {
        warn!(
            entity = %entity.label(),
            current = %entity.status(),
            requested = %status,
            "Ignoring status change of a finished entity"
        );
        return entity;
    }

    entity.set_status(status);
    if status.is_terminal() {
        entity.set_end(Utc::now());
    }
    entity
}

/// One invocation of the multi-unit pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Option<i64>,
    pub run_type: EngineRunType,
    pub includes_cleaning: bool,
    pub forecast_periods: u32,
    pub prediction_start_month: NaiveDate,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates an unsaved run in INITIALIZED.
    pub fn new(config: &RunConfig) -> Self {
        Self {
            id: None,
            run_type: config.run_type,
            includes_cleaning: config.includes_cleaning,
            forecast_periods: config.forecast_periods,
            prediction_start_month: config.prediction_month,
            status: RunStatus::Initialized,
            start: Utc::now(),
            end: None,
        }
    }
}

impl Tracked for Run {
    type Status = RunStatus;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn status(&self) -> RunStatus {
        self.status
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    fn label(&self) -> String {
        match self.id {
            Some(id) => format!("run {}", id),
            None => "run (unsaved)".to_string(),
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    fn set_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
    }
}

/// One unit's sub-run within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRun {
    pub id: Option<i64>,
    pub run_id: Option<i64>,
    pub unit: String,
    pub status: UnitRunStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl UnitRun {
    /// Creates an unsaved unit run in INITIALIZED.
    pub fn new(run_id: Option<i64>, unit: impl Into<String>) -> Self {
        Self {
            id: None,
            run_id,
            unit: unit.into(),
            status: UnitRunStatus::Initialized,
            start: Utc::now(),
            end: None,
        }
    }
}

impl Tracked for UnitRun {
    type Status = UnitRunStatus;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn status(&self) -> UnitRunStatus {
        self.status
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    fn label(&self) -> String {
        format!("unit run '{}'", self.unit)
    }

    fn set_status(&mut self, status: UnitRunStatus) {
        self.status = status;
    }

    fn set_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
    }
}
