//! Cleaned-data selection and reconciliation of stored forecast actuals.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{DataError, ForecastError};
use crate::pipeline::{month_from_key, month_key};
use crate::storage::{Database, DatabaseError};

/// SQL accuracy of `actual` against `forecast_data.prediction_post`, matching [`super::accuracy`].
fn accuracy_sql(actual: &str) -> String {
    format!(
        "CASE WHEN {a} = prediction_post THEN 1.0 \
         WHEN MAX({a}, prediction_post) <= 0 THEN 0.0 \
         ELSE 1.0 - ABS({a} - prediction_post) * 1.0 / MAX({a}, prediction_post) END",
        a = actual
    )
}

/// Resolves which cleaned data a run uses and back-fills actuals of older forecasts.
#[derive(Clone)]
pub struct Reconciler {
    database: Arc<Database>,
}

impl Reconciler {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Run id whose cleaned data this run forecasts from.
    ///
    /// `None` with storage disabled. A cleaning run uses its own id. Other runs
    /// reuse the newest completed cleaning run, which must be the only run
    /// with rows left in `cleaned_data`.
    pub async fn cleaned_data_run_id(
        &self,
        includes_cleaning: bool,
        run_id: Option<i64>,
    ) -> Result<Option<i64>, ForecastError> {
        let Some(pool) = self.database.pool() else {
            warn!("Database disabled, cleaned data is read from processed files");
            return Ok(None);
        };
        if includes_cleaning {
            return Ok(run_id);
        }

        let retry = self.database.read_retry();
        let (cleaning_run_id,): (Option<i64>,) = retry
            .run("last_cleaning_run", || {
                sqlx::query_as(
                    "SELECT MAX(id) FROM forecast_run \
                     WHERE status = 'COMPLETED' AND includes_cleaning = 1",
                )
                .fetch_one(pool)
            })
            .await
            .map_err(DatabaseError::from)?;
        let stored: Vec<(i64,)> = retry
            .run("cleaned_data_run_ids", || {
                sqlx::query_as("SELECT DISTINCT run_id FROM cleaned_data ORDER BY run_id")
                    .fetch_all(pool)
            })
            .await
            .map_err(DatabaseError::from)?;
        let stored: Vec<i64> = stored.into_iter().map(|(id,)| id).collect();
        debug!(?cleaning_run_id, ?stored, "Looking up last successful cleaning run");

        match cleaning_run_id {
            Some(id) if stored == [id] => Ok(Some(id)),
            _ => Err(DataError::NoValidCleaning(format!(
                "last completed cleaning run {:?}, cleaned data present for runs {:?}",
                cleaning_run_id, stored
            ))
            .into()),
        }
    }

    /// Newest month present in the cleaned data of `cleaned_data_run_id`.
    ///
    /// Falls back to `prediction_month` when storage is disabled.
    pub async fn newest_month(
        &self,
        cleaned_data_run_id: Option<i64>,
        prediction_month: NaiveDate,
    ) -> Result<NaiveDate, ForecastError> {
        let (Some(pool), Some(run_id)) = (self.database.pool(), cleaned_data_run_id) else {
            warn!(%prediction_month, "Database disabled, assuming the prediction month is the newest month");
            return Ok(prediction_month);
        };

        let (newest,): (Option<i64>,) = self
            .database
            .read_retry()
            .run("newest_cleaned_month", || {
                sqlx::query_as("SELECT MAX(date_yyyymm) FROM cleaned_data WHERE run_id = ?")
                    .bind(run_id)
                    .fetch_one(pool)
            })
            .await
            .map_err(DatabaseError::from)?;

        newest
            .and_then(month_from_key)
            .ok_or_else(|| DataError::NoCleanedData(run_id).into())
    }

    /// Updates actuals and accuracy of stored forecasts from cleaned data.
    ///
    /// Actuals found in the cleaned data overwrite stored ones. Remaining
    /// NULL actuals become zero for predicted months up to `newest_month`;
    /// later months are left untouched. Accuracy is then recomputed wherever
    /// an actual exists, all in one transaction. Returns the number of
    /// actuals written.
    pub async fn update_actuals(
        &self,
        cleaned_data_run_id: Option<i64>,
        newest_month: NaiveDate,
    ) -> Result<u64, ForecastError> {
        if self.database.is_disabled() {
            warn!("Database disabled, skipping update of previous forecasts");
            return Ok(0);
        }
        let run_id = cleaned_data_run_id.ok_or_else(|| {
            DataError::NoValidCleaning("no cleaned data run to reconcile against".to_string())
        })?;

        let actual_sql = "UPDATE forecast_data SET actual = \
             (SELECT CAST(ROUND(SUM(c.order_quantity)) AS INTEGER) FROM cleaned_data c \
              WHERE c.run_id = ? AND c.contract_id = forecast_data.contract_id \
              AND c.item_id = forecast_data.item_id AND c.date_yyyymm = forecast_data.predicted_month) \
             WHERE EXISTS (SELECT 1 FROM cleaned_data c \
              WHERE c.run_id = ? AND c.contract_id = forecast_data.contract_id \
              AND c.item_id = forecast_data.item_id AND c.date_yyyymm = forecast_data.predicted_month)";
        let accuracy_update = format!(
            "UPDATE forecast_data SET accuracy = {} WHERE actual IS NOT NULL",
            accuracy_sql("actual")
        );

        let mut scope = self.database.begin().await?;
        let result = async {
            let existing = sqlx::query(actual_sql)
                .bind(run_id)
                .bind(run_id)
                .execute(scope.conn())
                .await?
                .rows_affected();
            let nulls = sqlx::query(
                "UPDATE forecast_data SET actual = 0 WHERE actual IS NULL AND predicted_month <= ?",
            )
            .bind(month_key(newest_month))
            .execute(scope.conn())
            .await?
            .rows_affected();
            sqlx::query(&accuracy_update).execute(scope.conn()).await?;
            Ok::<(u64, u64), DatabaseError>((existing, nulls))
        }
        .await;
        let (updated_existing, updated_nulls) = scope.finish(result).await?;

        info!(rows = updated_existing, "Updated forecast actuals from cleaned data");
        info!(rows = updated_nulls, %newest_month, "Set missing forecast actuals to zero");
        Ok(updated_existing + updated_nulls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::records::{CleanedRecord, CleanedRow, ForecastRecord};
    use crate::pipeline::DatabaseConfig;
    use tempfile::TempDir;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    async fn temp_database(dir: &TempDir) -> Arc<Database> {
        let config = DatabaseConfig::sqlite_file(dir.path().join("reconcile.db"));
        let db = Database::connect(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        Arc::new(db)
    }

    async fn insert_run(db: &Database, status: &str, includes_cleaning: bool) -> i64 {
        let done = sqlx::query(
            "INSERT INTO forecast_run (run_type, includes_cleaning, forecast_periods, \
             prediction_start_month, status, start_time) VALUES ('development', ?, 3, 202001, ?, '2020-01-01T00:00:00Z')",
        )
        .bind(includes_cleaning)
        .bind(status)
        .execute(db.pool().unwrap())
        .await
        .unwrap();
        done.last_insert_rowid()
    }

    fn cleaned(m: u32, qty: f64) -> CleanedRecord {
        CleanedRecord {
            project_id: "P1".to_string(),
            contract_id: "C1".to_string(),
            master_number: "M1".to_string(),
            date: month(2020, m),
            item_id: 1,
            unit_cost: 1.0,
            order_quantity: qty,
            order_cost: qty,
        }
    }

    fn forecast(predicted: NaiveDate, post: f64) -> ForecastRecord {
        ForecastRecord {
            model_run_id: Some(1),
            contract_id: "C1".to_string(),
            master_number: "M1".to_string(),
            item_id: 1,
            prediction_start_month: month(2020, 1),
            predicted_month: predicted,
            prediction_months_delta: 0,
            prediction_raw: post,
            prediction_post: post,
            actual: None,
            accuracy: None,
        }
    }

    #[tokio::test]
    async fn test_disabled_database_resolution() {
        let db = Arc::new(Database::disabled(DatabaseConfig::disabled()));
        let reconciler = Reconciler::new(db);

        assert_eq!(reconciler.cleaned_data_run_id(false, None).await.unwrap(), None);
        assert_eq!(
            reconciler.newest_month(None, month(2020, 5)).await.unwrap(),
            month(2020, 5)
        );
        assert_eq!(reconciler.update_actuals(None, month(2020, 5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleaning_run_uses_own_id() {
        let dir = TempDir::new().unwrap();
        let reconciler = Reconciler::new(temp_database(&dir).await);
        assert_eq!(
            reconciler.cleaned_data_run_id(true, Some(9)).await.unwrap(),
            Some(9)
        );
    }

    #[tokio::test]
    async fn test_last_successful_cleaning_run() {
        let dir = TempDir::new().unwrap();
        let db = temp_database(&dir).await;
        let first = insert_run(&db, "COMPLETED", true).await;
        let _failed = insert_run(&db, "FAILED", true).await;
        let _forward = insert_run(&db, "COMPLETED", false).await;

        let records = [cleaned(1, 1.0)];
        let rows: Vec<_> = records
            .iter()
            .map(|r| CleanedRow { run_id: first, record: r })
            .collect();
        db.bulk_insert(&rows).await.unwrap();

        let reconciler = Reconciler::new(db);
        assert_eq!(
            reconciler.cleaned_data_run_id(false, None).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_mismatched_cleaned_data_requires_reload() {
        let dir = TempDir::new().unwrap();
        let db = temp_database(&dir).await;
        insert_run(&db, "COMPLETED", true).await;

        let reconciler = Reconciler::new(db);
        let err = reconciler.cleaned_data_run_id(false, None).await.unwrap_err();
        assert!(matches!(err, ForecastError::Data(DataError::NoValidCleaning(_))));
        assert!(err.to_string().contains("--force-reload"));
    }

    #[tokio::test]
    async fn test_newest_month() {
        let dir = TempDir::new().unwrap();
        let db = temp_database(&dir).await;
        let records = [cleaned(1, 1.0), cleaned(4, 2.0)];
        let rows: Vec<_> = records
            .iter()
            .map(|r| CleanedRow { run_id: 3, record: r })
            .collect();
        db.bulk_insert(&rows).await.unwrap();

        let reconciler = Reconciler::new(db);
        assert_eq!(
            reconciler.newest_month(Some(3), month(2021, 1)).await.unwrap(),
            month(2020, 4)
        );
        assert!(matches!(
            reconciler.newest_month(Some(4), month(2021, 1)).await,
            Err(ForecastError::Data(DataError::NoCleanedData(4)))
        ));
    }

    #[tokio::test]
    async fn test_update_actuals() {
        let dir = TempDir::new().unwrap();
        let db = temp_database(&dir).await;
        let run_id = insert_run(&db, "RUN_MODELS", true).await;
        sqlx::query(
            "INSERT INTO forecast_model_run (id, run_id, model_name, status, start_time) \
             VALUES (1, ?, 'Account_1', 'COMPLETED', '2020-01-01T00:00:00Z')",
        )
        .bind(run_id)
        .execute(db.pool().unwrap())
        .await
        .unwrap();

        let records = [cleaned(2, 8.0)];
        let rows: Vec<_> = records
            .iter()
            .map(|r| CleanedRow { run_id, record: r })
            .collect();
        db.bulk_insert(&rows).await.unwrap();
        db.bulk_insert(&[
            forecast(month(2020, 2), 10.0),
            forecast(month(2020, 3), 4.0),
            forecast(month(2020, 5), 4.0),
        ])
        .await
        .unwrap();

        let reconciler = Reconciler::new(db.clone());
        let updated = reconciler
            .update_actuals(Some(run_id), month(2020, 3))
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let rows: Vec<(i64, Option<i64>, Option<f64>)> = sqlx::query_as(
            "SELECT predicted_month, actual, accuracy FROM forecast_data ORDER BY predicted_month",
        )
        .fetch_all(db.pool().unwrap())
        .await
        .unwrap();

        assert_eq!(rows[0].0, 202002);
        assert_eq!(rows[0].1, Some(8));
        assert!((rows[0].2.unwrap() - 0.8).abs() < 1e-9);

        assert_eq!(rows[1].1, Some(0));
        assert_eq!(rows[1].2, Some(0.0));

        assert_eq!(rows[2].1, None);
        assert_eq!(rows[2].2, None);
    }
}
