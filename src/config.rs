use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, ValueEnum};

const DEFAULT_AUTH_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_REPORTING_API_URL: &str = "https://reporting.api.bingads.microsoft.com/Reporting/v13";
const DEFAULT_TENANT: &str = "common";
const WAREHOUSE_DIR: &str = "./warehouse";
const WAREHOUSE_DATASET: &str = "ads";
const WAREHOUSE_TABLE: &str = "ad_performance_daily";

/// Granularity of the performance report requested from the vendor.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportLevel {
    Campaign,
    AdGroup,
    Ad,
}

#[derive(ClapArgs, Clone)]
pub struct Config {
    #[arg(long, env = "CLIENT_ID")]
    pub(crate) client_id: String,

    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    pub(crate) client_secret: String,

    #[arg(long, default_value = DEFAULT_TENANT, env = "TENANT_ID")]
    pub(crate) tenant_id: String,

    #[arg(long, env = "DEVELOPER_TOKEN", hide_env_values = true)]
    pub(crate) developer_token: String,

    /// Long-lived refresh token from the consent flow. Optional when the token
    /// cache file already holds one.
    #[arg(long, env = "REFRESH_TOKEN", hide_env_values = true)]
    pub(crate) refresh_token: Option<String>,

    #[arg(long, env = "CUSTOMER_ID")]
    pub(crate) customer_id: String,

    #[arg(long, env = "CUSTOMER_ACCOUNT_ID", value_delimiter = ',', required = true)]
    pub(crate) customer_account_ids: Vec<String>,

    #[arg(long, env = "TOKENS_FILE")]
    pub(crate) tokens_file: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_AUTH_URL, env = "AUTH_URL")]
    pub(crate) auth_url: String,

    #[arg(long, default_value = DEFAULT_REPORTING_API_URL, env = "REPORTING_API_URL")]
    pub(crate) reporting_api_url: String,

    #[arg(long, default_value = WAREHOUSE_DIR, env = "WAREHOUSE_DIR")]
    pub(crate) warehouse_dir: PathBuf,

    #[arg(long, default_value = WAREHOUSE_DATASET, env = "WAREHOUSE_DATASET")]
    pub(crate) dataset: String,

    #[arg(long, default_value = WAREHOUSE_TABLE, env = "WAREHOUSE_TABLE")]
    pub(crate) table: String,

    #[arg(long, value_enum, default_value_t = ReportLevel::Ad, env = "REPORT_LEVEL")]
    pub(crate) report_level: ReportLevel,

    #[arg(long, default_value_t = 5, env = "POLL_INITIAL_SECS")]
    pub(crate) poll_initial_secs: u64,

    #[arg(long, default_value_t = 60, env = "POLL_MAX_SECS")]
    pub(crate) poll_max_secs: u64,

    #[arg(long, default_value_t = 1800, env = "POLL_TIMEOUT_SECS")]
    pub(crate) poll_timeout_secs: u64,

    #[arg(long, default_value_t = 3, env = "MAX_JOB_ATTEMPTS")]
    pub(crate) max_job_attempts: u32,

    #[arg(long, default_value_t = 3, env = "MAX_DOWNLOAD_ATTEMPTS")]
    pub(crate) max_download_attempts: u32,

    #[arg(long, default_value_t = 3, env = "MAX_LOAD_ATTEMPTS")]
    pub(crate) max_load_attempts: u32,

    #[arg(long, default_value_t = 2000, env = "RETRY_BASE_MS")]
    pub(crate) retry_base_ms: u64,

    #[arg(long, default_value_t = 5000, env = "LOAD_BATCH_SIZE")]
    pub(crate) load_batch_size: usize,

    #[arg(long, default_value_t = 4, env = "MAX_CONCURRENT_REQUESTS")]
    pub(crate) max_concurrent_requests: usize,

    #[arg(long, default_value_t = 250, env = "MIN_REQUEST_INTERVAL_MS")]
    pub(crate) min_request_interval_ms: u64,

    /// Abort a run that has not finished after this many seconds.
    #[arg(long, env = "RUN_TIMEOUT_SECS")]
    pub(crate) run_timeout_secs: Option<u64>,

    #[arg(long, default_value_t = 300, env = "REFRESH_MARGIN_SECS")]
    pub(crate) refresh_margin_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("developer_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("customer_id", &self.customer_id)
            .field("customer_account_ids", &self.customer_account_ids)
            .field("warehouse_dir", &self.warehouse_dir)
            .field("dataset", &self.dataset)
            .field("table", &self.table)
            .field("report_level", &self.report_level)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests(warehouse_dir: &std::path::Path) -> Self {
        Config {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            developer_token: "dev-token".to_string(),
            refresh_token: Some("refresh".to_string()),
            customer_id: "1000".to_string(),
            customer_account_ids: vec!["2000".to_string()],
            tokens_file: None,
            auth_url: "http://localhost:1".to_string(),
            reporting_api_url: "http://localhost:1/Reporting/v13".to_string(),
            warehouse_dir: warehouse_dir.to_path_buf(),
            dataset: WAREHOUSE_DATASET.to_string(),
            table: WAREHOUSE_TABLE.to_string(),
            report_level: ReportLevel::Campaign,
            poll_initial_secs: 5,
            poll_max_secs: 60,
            poll_timeout_secs: 1800,
            max_job_attempts: 3,
            max_download_attempts: 3,
            max_load_attempts: 3,
            retry_base_ms: 100,
            load_batch_size: 100,
            max_concurrent_requests: 2,
            min_request_interval_ms: 0,
            run_timeout_secs: None,
            refresh_margin_secs: 300,
        }
    }
}
