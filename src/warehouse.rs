use crate::config::Config;
use crate::data::{batch_to_records, records_to_batch, warehouse_schema, NaturalKey, WarehouseRecord};
use crate::error::Error;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const PARTITION_PREFIX: &str = "account=";
const STAGING_PREFIX: &str = "_staging-";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Inserts or replaces records by natural key.
    ///
    /// # Arguments
    /// * `records` - Records with unique natural keys.
    ///
    /// # Returns
    /// A Result containing either the number of records written or an Error.
    async fn upsert(&self, records: &[WarehouseRecord]) -> Result<usize, Error>;
}

/// Parquet-backed table, one file per account partition:
/// `{root}/{dataset}/{table}/account={id}.parquet`.
pub struct ParquetWarehouse {
    table_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ParquetWarehouse {
    pub fn new(config: &Config) -> Self {
        ParquetWarehouse {
            table_dir: config
                .warehouse_dir
                .join(&config.dataset)
                .join(&config.table),
            write_lock: Mutex::new(()),
        }
    }

    fn partition_path(&self, account_id: &str) -> PathBuf {
        self.table_dir
            .join(format!("{PARTITION_PREFIX}{account_id}.parquet"))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<WarehouseRecord>, Error> {
        let ctx = SessionContext::new();
        let schema = warehouse_schema();
        let path = path
            .to_str()
            .ok_or_else(|| Error::Load(format!("non UTF-8 path {}", path.display())))?;

        let batches = ctx
            .read_parquet(path, ParquetReadOptions::default().schema(&schema))
            .await?
            .collect()
            .await?;

        let mut records = Vec::new();
        for batch in &batches {
            records.extend(batch_to_records(batch)?);
        }
        Ok(records)
    }

    /// Current rows of one account partition.
    pub async fn read_partition(&self, account_id: &str) -> Result<Vec<WarehouseRecord>, Error> {
        let path = self.partition_path(account_id);
        if !tokio::fs::try_exists(&path).await.map_err(load_io)? {
            return Ok(Vec::new());
        }
        self.read_file(&path).await
    }

    /// Current rows of every partition, ordered by natural key.
    #[cfg(test)]
    pub async fn read_all(&self) -> Result<Vec<WarehouseRecord>, Error> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.table_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(load_io(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(load_io)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(PARTITION_PREFIX) && name.ends_with(".parquet") {
                paths.push(entry.path());
            }
        }

        let mut records = Vec::new();
        for path in paths {
            records.extend(self.read_file(&path).await?);
        }
        records.sort_by_key(WarehouseRecord::natural_key);
        Ok(records)
    }

    async fn write_partition(
        &self,
        account_id: &str,
        records: &[WarehouseRecord],
    ) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.table_dir)
            .await
            .map_err(load_io)?;

        let staging = self
            .table_dir
            .join(format!("{STAGING_PREFIX}{PARTITION_PREFIX}{account_id}.parquet"));
        let staging_str = staging
            .to_str()
            .ok_or_else(|| Error::Load(format!("non UTF-8 path {}", staging.display())))?;

        let ctx = SessionContext::new();
        ctx.read_batch(records_to_batch(records)?)?
            .write_parquet(
                staging_str,
                DataFrameWriteOptions::new().with_single_file_output(true),
                None,
            )
            .await?;

        tokio::fs::rename(&staging, self.partition_path(account_id))
            .await
            .map_err(load_io)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Warehouse for ParquetWarehouse {
    async fn upsert(&self, records: &[WarehouseRecord]) -> Result<usize, Error> {
        let _guard = self.write_lock.lock().await;

        let mut by_account: BTreeMap<&str, Vec<&WarehouseRecord>> = BTreeMap::new();
        for record in records {
            by_account
                .entry(record.account_id.as_str())
                .or_default()
                .push(record);
        }

        for (account_id, incoming) in by_account {
            let mut rows: BTreeMap<NaturalKey, WarehouseRecord> = self
                .read_partition(account_id)
                .await?
                .into_iter()
                .map(|r| (r.natural_key(), r))
                .collect();
            let existing = rows.len();

            for record in incoming {
                rows.insert(record.natural_key(), record.clone());
            }

            let merged: Vec<WarehouseRecord> = rows.into_values().collect();
            debug!(
                "account {}: merging {} existing rows into {} total",
                account_id,
                existing,
                merged.len()
            );
            self.write_partition(account_id, &merged).await?;
        }

        Ok(records.len())
    }
}

fn load_io(err: std::io::Error) -> Error {
    Error::Load(err.to_string())
}

/// Records split into bounded upsert batches.
#[derive(Debug, Default)]
pub struct LoadPlan {
    pub batches: Vec<Vec<WarehouseRecord>>,
    /// Records dropped because a later record had the same natural key.
    pub duplicates: usize,
}

impl LoadPlan {
    pub fn records(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Deduplicates and batches normalized records for the warehouse.
pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    batch_size: usize,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, batch_size: usize) -> Self {
        WarehouseLoader {
            warehouse,
            batch_size: batch_size.max(1),
        }
    }

    /// Keeps the last record per natural key, preserving first-seen order,
    /// and splits the result into batches.
    pub fn plan(&self, records: Vec<WarehouseRecord>) -> LoadPlan {
        let total = records.len();
        let mut position: HashMap<NaturalKey, usize> = HashMap::with_capacity(total);
        let mut unique: Vec<WarehouseRecord> = Vec::with_capacity(total);

        for record in records {
            let key = record.natural_key();
            if let Some(&i) = position.get(&key) {
                unique[i] = record;
            } else {
                position.insert(key, unique.len());
                unique.push(record);
            }
        }

        let duplicates = total - unique.len();
        let batches = unique
            .chunks(self.batch_size)
            .map(<[WarehouseRecord]>::to_vec)
            .collect();

        LoadPlan {
            batches,
            duplicates,
        }
    }

    /// Writes one batch. A failed batch is retried whole by the caller.
    pub async fn write_batch(&self, batch: &[WarehouseRecord]) -> Result<usize, Error> {
        let written = self.warehouse.upsert(batch).await?;
        info!("loaded batch of {} records", written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample_record;
    use tempfile::TempDir;

    fn warehouse(dir: &TempDir) -> ParquetWarehouse {
        ParquetWarehouse::new(&Config::for_tests(dir.path()))
    }

    #[tokio::test]
    async fn test_upsert_into_empty_warehouse() {
        let dir = TempDir::new().unwrap();
        let warehouse = warehouse(&dir);
        let records = vec![
            sample_record("456", "2023-10-01"),
            sample_record("789", "2023-10-01"),
        ];

        assert_eq!(warehouse.upsert(&records).await.unwrap(), 2);
        assert_eq!(warehouse.read_all().await.unwrap().len(), 2);
        assert!(dir
            .path()
            .join("ads/ad_performance_daily/account=2000.parquet")
            .exists());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let warehouse = warehouse(&dir);
        let records = vec![
            sample_record("456", "2023-10-01"),
            sample_record("456", "2023-10-02"),
            sample_record("789", "2023-10-01"),
        ];

        warehouse.upsert(&records).await.unwrap();
        let once = warehouse.read_all().await.unwrap();
        warehouse.upsert(&records).await.unwrap();
        let twice = warehouse.read_all().await.unwrap();

        assert_eq!(once.len(), 3);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_natural_key() {
        let dir = TempDir::new().unwrap();
        let warehouse = warehouse(&dir);
        warehouse
            .upsert(&[sample_record("456", "2023-10-01")])
            .await
            .unwrap();

        let mut updated = sample_record("456", "2023-10-01");
        updated.clicks = 999;
        let mut other_account = sample_record("456", "2023-10-01");
        other_account.account_id = "3000".to_string();
        warehouse
            .upsert(&[updated.clone(), other_account])
            .await
            .unwrap();

        let rows = warehouse.read_partition("2000").await.unwrap();
        assert_eq!(rows, vec![updated]);
        assert_eq!(warehouse.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_all_without_table() {
        let dir = TempDir::new().unwrap();
        assert!(warehouse(&dir).read_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_plan_deduplicates_last_write_wins() {
        let loader = WarehouseLoader::new(Arc::new(MockWarehouse::new()), 2);
        let mut later = sample_record("456", "2023-10-01");
        later.clicks = 7;
        let records = vec![
            sample_record("456", "2023-10-01"),
            sample_record("789", "2023-10-01"),
            later.clone(),
            sample_record("111", "2023-10-01"),
        ];

        let plan = loader.plan(records);
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.records(), 3);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0][0], later);
    }

    #[test]
    fn test_plan_empty() {
        let loader = WarehouseLoader::new(Arc::new(MockWarehouse::new()), 10);
        let plan = loader.plan(vec![]);
        assert!(plan.batches.is_empty());
        assert_eq!(plan.duplicates, 0);
    }

    #[tokio::test]
    async fn test_write_batch_surfaces_failure() {
        let mut mock = MockWarehouse::new();
        mock.expect_upsert()
            .times(1)
            .returning(|_| Err(Error::Load("disk full".into())));

        let loader = WarehouseLoader::new(Arc::new(mock), 10);
        let err = loader
            .write_batch(&[sample_record("456", "2023-10-01")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Load(_)));
    }
}
