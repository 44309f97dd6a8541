//! Persistence of runs and unit runs.
//!
//! Every status write happens inside a transactional scope: the persisted
//! status is read back, the guarded transition is applied to it, and the
//! result is written only if it changed. With storage disabled the store keeps
//! entities in memory and applies the same transition without raising.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::pipeline::{month_from_key, month_key, EngineRunType};
use crate::storage::schema::tables;
use crate::storage::{Database, DatabaseError};

use super::model::{transition, Run, Tracked, UnitRun};
use super::status::{RunStatus, StatusValue, UnitRunStatus, TERMINAL_STATUS_SQL};

const RUN_COLUMNS: &str = "id, run_type, includes_cleaning, forecast_periods, \
     prediction_start_month, status, start_time, end_time";

const UNIT_RUN_COLUMNS: &str = "id, run_id, model_name, status, start_time, end_time";

/// Store for [`Run`] and [`UnitRun`] entities.
#[derive(Clone)]
pub struct RunStore {
    database: Arc<Database>,
}

impl RunStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Persists a new run and assigns its id. No-op when storage is disabled.
    pub async fn insert_run(&self, run: &mut Run) -> Result<(), DatabaseError> {
        if self.database.is_disabled() {
            debug!("Database disabled, run kept in memory only");
            return Ok(());
        }

        let mut scope = self.database.begin().await?;
        let result = async {
            let done = sqlx::query(
                "INSERT INTO forecast_run (run_type, includes_cleaning, forecast_periods, \
                 prediction_start_month, status, start_time, end_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run.run_type.as_str())
            .bind(run.includes_cleaning)
            .bind(i64::from(run.forecast_periods))
            .bind(month_key(run.prediction_start_month))
            .bind(run.status.as_str())
            .bind(run.start)
            .bind(run.end)
            .execute(scope.conn())
            .await?;
            Ok::<i64, DatabaseError>(done.last_insert_rowid())
        }
        .await;

        let id = scope.finish(result).await?;
        run.id = Some(id);
        info!(run_id = id, run_type = %run.run_type, "Created run");
        Ok(())
    }

    /// Persists a new unit run and assigns its id. No-op when storage is disabled.
    pub async fn insert_unit_run(&self, unit_run: &mut UnitRun) -> Result<(), DatabaseError> {
        if self.database.is_disabled() {
            return Ok(());
        }
        let run_id = unit_run.run_id.ok_or_else(|| {
            DatabaseError::NotFound(format!("owning run of {}", unit_run.label()))
        })?;

        let mut scope = self.database.begin().await?;
        let result = async {
            let done = sqlx::query(
                "INSERT INTO forecast_model_run (run_id, model_name, status, start_time, end_time) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(&unit_run.unit)
            .bind(unit_run.status.as_str())
            .bind(unit_run.start)
            .bind(unit_run.end)
            .execute(scope.conn())
            .await?;
            Ok::<i64, DatabaseError>(done.last_insert_rowid())
        }
        .await;

        unit_run.id = Some(scope.finish(result).await?);
        debug!(unit = %unit_run.unit, unit_run_id = ?unit_run.id, "Created unit run");
        Ok(())
    }

    /// Moves a run to `status` through the guarded transition.
    pub async fn update_run_status(
        &self,
        run: &mut Run,
        status: RunStatus,
    ) -> Result<(), DatabaseError> {
        self.apply_transition(tables::FORECAST_RUN, run, status)
            .await?;
        info!(run_id = ?run.id, status = %run.status, "Run status");
        Ok(())
    }

    /// Moves a unit run to `status` through the guarded transition.
    pub async fn update_unit_status(
        &self,
        unit_run: &mut UnitRun,
        status: UnitRunStatus,
    ) -> Result<(), DatabaseError> {
        self.apply_transition(tables::FORECAST_MODEL_RUN, unit_run, status)
            .await?;
        debug!(unit = %unit_run.unit, status = %unit_run.status, "Unit run status");
        Ok(())
    }

    async fn apply_transition<E>(
        &self,
        table: &'static str,
        entity: &mut E,
        status: E::Status,
    ) -> Result<(), DatabaseError>
    where
        E: Tracked + Clone,
    {
        if self.database.is_disabled() {
            *entity = transition(entity.clone(), status);
            return Ok(());
        }
        let id = entity
            .id()
            .ok_or_else(|| DatabaseError::NotFound(format!("{} was never saved", entity.label())))?;

        let mut scope = self.database.begin().await?;
        let result = async {
            let select = format!("SELECT status, end_time FROM {} WHERE id = ?", table);
            let row: Option<(String, Option<chrono::DateTime<Utc>>)> = sqlx::query_as(&select)
                .bind(id)
                .fetch_optional(scope.conn())
                .await?;
            let (stored, stored_end) =
                row.ok_or_else(|| DatabaseError::NotFound(entity.label()))?;
            let stored: E::Status = stored.parse().map_err(serialization)?;

            let mut current = entity.clone();
            current.set_status(stored);
            if let Some(end) = stored_end {
                current.set_end(end);
            }

            let updated = transition(current, status);
            if updated.status() != stored {
                let update = format!("UPDATE {} SET status = ?, end_time = ? WHERE id = ?", table);
                sqlx::query(&update)
                    .bind(updated.status().as_str())
                    .bind(updated.end())
                    .bind(id)
                    .execute(scope.conn())
                    .await?;
            }
            Ok::<E, DatabaseError>(updated)
        }
        .await;

        *entity = scope.finish(result).await?;
        Ok(())
    }

    /// Forces every non-terminal unit run of `run_id` to CANCELLED.
    ///
    /// Returns the number of unit runs changed.
    pub async fn cancel_open_unit_runs(&self, run_id: i64) -> Result<u64, DatabaseError> {
        if self.database.is_disabled() {
            return Ok(0);
        }

        let mut scope = self.database.begin().await?;
        let result = async {
            let sql = format!(
                "UPDATE forecast_model_run SET status = ?, end_time = ? \
                 WHERE run_id = ? AND status NOT IN {}",
                TERMINAL_STATUS_SQL
            );
            let done = sqlx::query(&sql)
                .bind(UnitRunStatus::Cancelled.as_str())
                .bind(Utc::now())
                .bind(run_id)
                .execute(scope.conn())
                .await?;
            Ok::<u64, DatabaseError>(done.rows_affected())
        }
        .await;

        let cancelled = scope.finish(result).await?;
        info!(run_id, cancelled, "Cancelled open unit runs");
        Ok(cancelled)
    }

    /// Loads one run.
    pub async fn get_run(&self, id: i64) -> Result<Option<Run>, DatabaseError> {
        let pool = self.database.require_pool("load run")?;
        let sql = format!("SELECT {} FROM forecast_run WHERE id = ?", RUN_COLUMNS);
        let row = self
            .database
            .read_retry()
            .run("get_run", || sqlx::query(&sql).bind(id).fetch_optional(pool))
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Most recent runs, newest first.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<Run>, DatabaseError> {
        let pool = self.database.require_pool("list runs")?;
        let sql = format!(
            "SELECT {} FROM forecast_run ORDER BY id DESC LIMIT ?",
            RUN_COLUMNS
        );
        let rows = self
            .database
            .read_retry()
            .run("list_runs", || sqlx::query(&sql).bind(limit).fetch_all(pool))
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Unit runs of one run, in creation order.
    pub async fn unit_runs_for(&self, run_id: i64) -> Result<Vec<UnitRun>, DatabaseError> {
        let pool = self.database.require_pool("list unit runs")?;
        let sql = format!(
            "SELECT {} FROM forecast_model_run WHERE run_id = ? ORDER BY id",
            UNIT_RUN_COLUMNS
        );
        let rows = self
            .database
            .read_retry()
            .run("unit_runs_for", || {
                sqlx::query(&sql).bind(run_id).fetch_all(pool)
            })
            .await?;
        rows.iter().map(unit_run_from_row).collect()
    }
}

fn serialization(err: impl Display) -> DatabaseError {
    DatabaseError::Serialization(err.to_string())
}

fn run_from_row(row: &SqliteRow) -> Result<Run, DatabaseError> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;
    let month: i64 = row.try_get("prediction_start_month")?;
    let periods: i64 = row.try_get("forecast_periods")?;

    Ok(Run {
        id: Some(row.try_get("id")?),
        run_type: run_type.parse::<EngineRunType>().map_err(serialization)?,
        includes_cleaning: row.try_get("includes_cleaning")?,
        forecast_periods: u32::try_from(periods).map_err(serialization)?,
        prediction_start_month: month_from_key(month)
            .ok_or_else(|| serialization(format!("invalid month key {}", month)))?,
        status: status.parse().map_err(serialization)?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
    })
}

fn unit_run_from_row(row: &SqliteRow) -> Result<UnitRun, DatabaseError> {
    let status: String = row.try_get("status")?;
    Ok(UnitRun {
        id: Some(row.try_get("id")?),
        run_id: Some(row.try_get("run_id")?),
        unit: row.try_get("model_name")?,
        status: status.parse().map_err(serialization)?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
    })
}
