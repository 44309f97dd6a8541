//! Loading of cleaned account data for one unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{DataError, ForecastError};
use crate::pipeline::UnitConfig;
use crate::storage::{Database, DatabaseError};

use super::records::{AccountData, CleanedRecord};

/// Directory below the data location holding cleaned data when storage is disabled.
pub const PROCESSED_DIR: &str = "processed";

/// File holding the cleaned data of one contract.
pub fn processed_data_path(data_location: &Path, contract_id: &str) -> PathBuf {
    data_location
        .join(PROCESSED_DIR)
        .join(format!("cleaned_{}.csv", contract_id))
}

/// File holding the imported exogenous features when storage is disabled.
pub fn processed_exogenous_path(data_location: &Path) -> PathBuf {
    data_location.join(PROCESSED_DIR).join("exogenous_features.csv")
}

/// Loads cleaned data from storage, or from processed files when storage is disabled.
#[derive(Clone)]
pub struct DataLoader {
    database: Arc<Database>,
    data_location: PathBuf,
}

impl DataLoader {
    pub fn new(database: Arc<Database>, data_location: impl Into<PathBuf>) -> Self {
        Self {
            database,
            data_location: data_location.into(),
        }
    }

    /// Loads every cleaned record of the unit's contracts.
    ///
    /// With storage enabled the records of `cleaned_data_run_id` are read
    /// under the read retry policy.
    pub async fn load_account_data(
        &self,
        unit: &UnitConfig,
        cleaned_data_run_id: Option<i64>,
    ) -> Result<AccountData, ForecastError> {
        let records = match self.database.pool() {
            None => self.load_from_files(unit).await?,
            Some(pool) => {
                let run_id = cleaned_data_run_id.ok_or_else(|| {
                    DataError::NoValidCleaning("no cleaned data run was selected".to_string())
                })?;
                if unit.contracts.is_empty() {
                    Vec::new()
                } else {
                    let placeholders = vec!["?"; unit.contracts.len()].join(", ");
                    let sql = format!(
                        "SELECT project_id, contract_id, master_number, date, item_id, unit_cost, \
                         order_quantity, order_cost FROM cleaned_data \
                         WHERE run_id = ? AND contract_id IN ({}) \
                         ORDER BY contract_id, item_id, date",
                        placeholders
                    );
                    self.database
                        .read_retry()
                        .run("load_account_data", || {
                            let mut query = sqlx::query_as::<_, CleanedRecord>(&sql).bind(run_id);
                            for contract in &unit.contracts {
                                query = query.bind(contract.as_str());
                            }
                            query.fetch_all(pool)
                        })
                        .await
                        .map_err(DatabaseError::from)?
                }
            }
        };

        info!(unit = %unit.name, rows = records.len(), "Loaded account data");
        Ok(AccountData::new(unit.name.clone(), records))
    }

    async fn load_from_files(&self, unit: &UnitConfig) -> Result<Vec<CleanedRecord>, DataError> {
        let mut records = Vec::new();
        for contract in &unit.contracts {
            let path = processed_data_path(&self.data_location, contract);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No processed data for contract");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut reader = csv::Reader::from_reader(content.as_bytes());
            for record in reader.deserialize::<CleanedRecord>() {
                records.push(record?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::records::CleanedRow;
    use crate::pipeline::DatabaseConfig;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn record(contract: &str, month: u32, qty: f64) -> CleanedRecord {
        CleanedRecord {
            project_id: "P1".to_string(),
            contract_id: contract.to_string(),
            master_number: "M1".to_string(),
            date: NaiveDate::from_ymd_opt(2020, month, 1).unwrap(),
            item_id: 1,
            unit_cost: 1.0,
            order_quantity: qty,
            order_cost: qty,
        }
    }

    #[tokio::test]
    async fn test_load_from_database_filters_run_and_contracts() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig::sqlite_file(dir.path().join("data.db"));
        let db = Arc::new(Database::connect(&config).await.unwrap());
        db.run_migrations().await.unwrap();

        let current = [record("C1", 1, 2.0), record("C2", 1, 3.0), record("C3", 1, 4.0)];
        let stale = [record("C1", 1, 9.0)];
        let rows: Vec<_> = current
            .iter()
            .map(|r| CleanedRow { run_id: 2, record: r })
            .chain(stale.iter().map(|r| CleanedRow { run_id: 1, record: r }))
            .collect();
        db.bulk_insert(&rows).await.unwrap();

        let loader = DataLoader::new(db, dir.path());
        let unit = UnitConfig::new("Account_1", ["C1", "C2"]);
        let data = loader.load_account_data(&unit, Some(2)).await.unwrap();

        assert_eq!(data.unit, "Account_1");
        assert_eq!(data.records, vec![record("C1", 1, 2.0), record("C2", 1, 3.0)]);
    }

    #[tokio::test]
    async fn test_enabled_storage_requires_cleaning_run() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig::sqlite_file(dir.path().join("data.db"));
        let db = Arc::new(Database::connect(&config).await.unwrap());

        let loader = DataLoader::new(db, dir.path());
        let unit = UnitConfig::new("Account_1", ["C1"]);
        let err = loader.load_account_data(&unit, None).await.unwrap_err();
        assert!(matches!(err, ForecastError::Data(DataError::NoValidCleaning(_))));
    }

    #[tokio::test]
    async fn test_load_from_processed_files() {
        let dir = TempDir::new().unwrap();
        let path = processed_data_path(dir.path(), "C1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut writer = csv::Writer::from_path(&path).unwrap();
        writer.serialize(record("C1", 2, 5.0)).unwrap();
        writer.flush().unwrap();

        let db = Arc::new(Database::disabled(DatabaseConfig::disabled()));
        let loader = DataLoader::new(db, dir.path());

        let unit = UnitConfig::new("Account_1", ["C1", "C_MISSING"]);
        let data = loader.load_account_data(&unit, None).await.unwrap();
        assert_eq!(data.records, vec![record("C1", 2, 5.0)]);
    }
}
