use crate::config::Config;
use crate::data::DateRange;
use crate::error::Error;
use chrono::{DateTime, Days, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Last date fully loaded for one account.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Watermark {
    pub account_id: String,
    pub loaded_through: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

/// JSON watermark files kept next to the table they describe:
/// `{root}/{dataset}/_watermarks/{table}/{account}.json`.
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(config: &Config) -> Self {
        WatermarkStore {
            dir: config
                .warehouse_dir
                .join(&config.dataset)
                .join("_watermarks")
                .join(&config.table),
        }
    }

    fn path(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{account_id}.json"))
    }

    pub async fn load(&self, account_id: &str) -> Result<Option<Watermark>, Error> {
        let path = self.path(account_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map(Some).map_err(|e| {
                Error::Configuration(format!("watermark {} is corrupt: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the watermark forward to `loaded_through`. Never moves it back,
    /// so re-loading an old range leaves later progress intact.
    pub async fn advance(
        &self,
        account_id: &str,
        loaded_through: NaiveDate,
    ) -> Result<Watermark, Error> {
        if let Some(current) = self.load(account_id).await? {
            if current.loaded_through >= loaded_through {
                return Ok(current);
            }
        }

        let watermark = Watermark {
            account_id: account_id.to_string(),
            loaded_through,
            updated_at: Utc::now(),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(account_id);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(&watermark)?).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("watermark for {} now {}", account_id, loaded_through);

        Ok(watermark)
    }
}

/// Date range for an incremental run ending at `today - 1`.
///
/// Starts the day after the watermark, pulled back by `lookback_days` so late
/// vendor corrections are reloaded, or at `initial_start` when no watermark
/// exists yet. Returns `Ok(None)` when there is nothing new to load.
pub fn incremental_range(
    watermark: Option<&Watermark>,
    today: NaiveDate,
    lookback_days: u64,
    initial_start: Option<NaiveDate>,
) -> Result<Option<DateRange>, Error> {
    let end = today
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| Error::InvalidDate {
            date: today.to_string(),
        })?;

    let start = match (watermark, initial_start) {
        (Some(w), _) => w
            .loaded_through
            .checked_add_days(Days::new(1))
            .and_then(|d| d.checked_sub_days(Days::new(lookback_days)))
            .ok_or_else(|| Error::InvalidDate {
                date: w.loaded_through.to_string(),
            })?,
        (None, Some(start)) => start,
        (None, None) => {
            return Err(Error::Configuration(
                "no watermark recorded yet; pass --initial-start".to_string(),
            ))
        }
    };

    if start > end {
        return Ok(None);
    }
    DateRange::new(start, end).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn watermark(through: &str) -> Watermark {
        Watermark {
            account_id: "2000".to_string(),
            loaded_through: date(through),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_watermark() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(&Config::for_tests(dir.path()));
        assert_eq!(store.load("2000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(&Config::for_tests(dir.path()));

        store.advance("2000", date("2024-03-05")).await.unwrap();
        store.advance("2000", date("2024-03-02")).await.unwrap();

        let loaded = store.load("2000").await.unwrap().unwrap();
        assert_eq!(loaded.loaded_through, date("2024-03-05"));
        assert_eq!(store.load("3000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_watermark_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(&Config::for_tests(dir.path()));
        std::fs::create_dir_all(&store.dir).unwrap();
        std::fs::write(store.path("2000"), "not json").unwrap();

        assert!(matches!(
            store.load("2000").await,
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_incremental_range_from_watermark() {
        let range = incremental_range(Some(&watermark("2024-03-05")), date("2024-03-10"), 2, None)
            .unwrap()
            .unwrap();
        assert_eq!(range.start, date("2024-03-04"));
        assert_eq!(range.end, date("2024-03-09"));
    }

    #[test]
    fn test_incremental_range_up_to_date() {
        let range =
            incremental_range(Some(&watermark("2024-03-09")), date("2024-03-10"), 0, None).unwrap();
        assert_eq!(range, None);
    }

    #[test]
    fn test_incremental_range_needs_a_start() {
        assert!(matches!(
            incremental_range(None, date("2024-03-10"), 0, None),
            Err(Error::Configuration(_))
        ));

        let range = incremental_range(None, date("2024-03-10"), 0, Some(date("2024-03-01")))
            .unwrap()
            .unwrap();
        assert_eq!(range.days(), 9);
    }
}
