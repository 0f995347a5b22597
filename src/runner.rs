use crate::api_client::{ApiClient, ReportRequest, ReportingApi};
use crate::config::{Config, ReportLevel};
use crate::data::DateRange;
use crate::error::{Error, ErrorKind};
use crate::normalizer::NormalizedBatch;
use crate::payload_fetcher::PayloadFetcher;
use crate::rate_limit::ApiBudget;
use crate::report_requestor::{PollPolicy, ReportRequestor};
use crate::token_manager::{IdentityProvider, MicrosoftIdentity, TokenManager};
use crate::warehouse::{ParquetWarehouse, Warehouse, WarehouseLoader};
use crate::watermark::{incremental_range, WatermarkStore};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pipeline stage a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    TokenManager,
    ReportRequestor,
    PayloadFetcher,
    WarehouseLoader,
    Driver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub loaded: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunFailure {
    pub component: Component,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Outcome of one run, printed as a JSON line.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub account_id: String,
    /// Absent when the run failed before its date range was known.
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub outcome: RunOutcome,
    pub job_id: Option<String>,
    pub counts: RunCounts,
    pub rejections_by_reason: BTreeMap<String, usize>,
    /// The vendor had no rows for the range.
    pub empty_report: bool,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Report for an account whose run could not be started.
    fn setup_failed(
        account_id: &str,
        range: Option<DateRange>,
        component: Component,
        error: Error,
    ) -> Self {
        error!("could not start run for account {}: {}", account_id, error);
        let now = Utc::now();
        RunReport {
            account_id: account_id.to_string(),
            start: range.map(|r| r.start),
            end: range.map(|r| r.end),
            outcome: RunOutcome::Failed,
            job_id: None,
            counts: RunCounts::default(),
            rejections_by_reason: BTreeMap::new(),
            empty_report: false,
            failure: Some(RunFailure {
                component,
                kind: error.kind(),
                message: error.to_string(),
                attempts: 1,
            }),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Attempt bounds and backoff for the retryable stages.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub job_attempts: u32,
    /// Bounds token acquisition and downloads.
    pub network_attempts: u32,
    pub load_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            job_attempts: config.max_job_attempts.max(1),
            network_attempts: config.max_download_attempts.max(1),
            load_attempts: config.max_load_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), capped at 64x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1 << attempt.saturating_sub(1).min(6))
    }
}

struct StageFailure {
    component: Component,
    error: Error,
    attempts: u32,
}

impl StageFailure {
    fn new(component: Component, error: Error, attempts: u32) -> Self {
        StageFailure {
            component,
            error,
            attempts,
        }
    }
}

#[derive(Default)]
struct Progress {
    job_id: Option<String>,
    counts: RunCounts,
    rejections_by_reason: BTreeMap<String, usize>,
    empty_report: bool,
}

/// Runs token, request, fetch, normalize and load for one account. The only
/// place that decides between retrying a stage and failing the run.
pub struct Pipeline {
    account_id: String,
    level: ReportLevel,
    tokens: Arc<TokenManager>,
    requestor: ReportRequestor,
    fetcher: PayloadFetcher,
    loader: WarehouseLoader,
    watermarks: Arc<WatermarkStore>,
    retry: RetryPolicy,
    run_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        account_id: &str,
        tokens: Arc<TokenManager>,
        api: Arc<dyn ReportingApi>,
        warehouse: Arc<dyn Warehouse>,
        watermarks: Arc<WatermarkStore>,
    ) -> Self {
        Pipeline {
            account_id: account_id.to_string(),
            level: config.report_level,
            requestor: ReportRequestor::new(
                api.clone(),
                tokens.clone(),
                PollPolicy::from_config(config),
            ),
            tokens,
            fetcher: PayloadFetcher::new(api),
            loader: WarehouseLoader::new(warehouse, config.load_batch_size),
            watermarks,
            retry: RetryPolicy::from_config(config),
            run_timeout: config.run_timeout(),
        }
    }

    /// Loads `range` for this pipeline's account.
    ///
    /// Never returns an error: every failure ends up in the report.
    pub async fn run(&self, range: DateRange, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let mut progress = Progress::default();
        info!(
            "run for account {} started ({} to {}, {} day(s))",
            self.account_id,
            range.start,
            range.end,
            range.days()
        );

        let result = match self.run_timeout {
            Some(limit) => tokio::select! {
                result = self.execute(range, cancel, &mut progress) => result,
                _ = tokio::time::sleep(limit) => {
                    Err(StageFailure::new(Component::Driver, Error::RunTimeout(limit), 1))
                }
            },
            None => self.execute(range, cancel, &mut progress).await,
        };

        let failure = match result {
            Ok(()) => {
                info!(
                    "run for account {} succeeded: {:?}",
                    self.account_id, progress.counts
                );
                None
            }
            Err(stage) => {
                error!(
                    "run for account {} failed in {:?} after {} attempt(s): {}",
                    self.account_id, stage.component, stage.attempts, stage.error
                );
                Some(RunFailure {
                    component: stage.component,
                    kind: stage.error.kind(),
                    message: stage.error.to_string(),
                    attempts: stage.attempts,
                })
            }
        };

        RunReport {
            account_id: self.account_id.clone(),
            start: Some(range.start),
            end: Some(range.end),
            outcome: if failure.is_none() {
                RunOutcome::Succeeded
            } else {
                RunOutcome::Failed
            },
            job_id: progress.job_id,
            counts: progress.counts,
            rejections_by_reason: progress.rejections_by_reason,
            empty_report: progress.empty_report,
            failure,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn execute(
        &self,
        range: DateRange,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(), StageFailure> {
        self.attempt(
            Component::TokenManager,
            self.retry.network_attempts,
            cancel,
            || self.tokens.get_valid_token(),
        )
        .await?;

        let request = ReportRequest {
            account_id: self.account_id.clone(),
            date_range: range,
            level: self.level,
        };
        let job = self
            .attempt(
                Component::ReportRequestor,
                self.retry.job_attempts,
                cancel,
                || self.requestor.request(&request, cancel),
            )
            .await?;
        progress.job_id = Some(job.job_id.clone());

        let payload = self
            .attempt(
                Component::PayloadFetcher,
                self.retry.network_attempts,
                cancel,
                || self.fetcher.fetch(&job),
            )
            .await?;
        progress.empty_report = payload.is_empty();

        let mut batch = NormalizedBatch::default();
        for row in payload.rows() {
            let row = row.map_err(|e| StageFailure::new(Component::PayloadFetcher, e, 1))?;
            batch.push(&row);
        }
        drop(payload);

        progress.counts.fetched = batch.fetched;
        progress.counts.rejected = batch.rejected;
        progress.counts.normalized = batch.normalized();
        progress.rejections_by_reason = std::mem::take(&mut batch.rejections_by_reason);
        if batch.rejected > 0 {
            warn!(
                "account {}: rejected {} of {} rows",
                self.account_id, batch.rejected, batch.fetched
            );
        }

        let plan = self.loader.plan(batch.into_records());
        progress.counts.duplicates = plan.duplicates;
        info!(
            "account {}: loading {} records in {} batch(es), {} duplicates dropped",
            self.account_id,
            plan.records(),
            plan.batches.len(),
            plan.duplicates
        );

        for chunk in &plan.batches {
            if cancel.is_cancelled() {
                return Err(StageFailure::new(
                    Component::WarehouseLoader,
                    Error::Cancelled,
                    1,
                ));
            }
            progress.counts.loaded += self
                .attempt(
                    Component::WarehouseLoader,
                    self.retry.load_attempts,
                    cancel,
                    || self.loader.write_batch(chunk),
                )
                .await?;
        }

        self.watermarks
            .advance(&self.account_id, range.end)
            .await
            .map_err(|e| StageFailure::new(Component::Driver, e, 1))?;

        Ok(())
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or uses up `max_attempts`.
    async fn attempt<T, F, Fut>(
        &self,
        component: Component,
        max_attempts: u32,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(StageFailure::new(component, error, attempt));
            }

            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.retry.backoff(attempt));
            warn!(
                "{:?} attempt {}/{} failed: {}; retrying in {}ms",
                component,
                attempt,
                max_attempts,
                error,
                delay.as_millis()
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StageFailure::new(component, Error::Cancelled, attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Which dates to load.
#[derive(Clone, Debug)]
pub enum Window {
    Explicit(DateRange),
    /// From the account's watermark (minus the lookback) through yesterday.
    Incremental {
        lookback_days: u64,
        initial_start: Option<NaiveDate>,
    },
}

/// Reports of every run started by [`run_pipelines`].
#[derive(Debug, Default)]
pub struct RunSet {
    pub reports: Vec<RunReport>,
    /// Runs whose task panicked or was aborted before reporting.
    pub aborted: usize,
}

impl RunSet {
    pub fn succeeded(&self) -> bool {
        self.aborted == 0
            && self
                .reports
                .iter()
                .all(|r| r.outcome == RunOutcome::Succeeded)
    }
}

/// Vendor, identity and storage handles shared by every run.
pub struct Services {
    pub api: Arc<dyn ReportingApi>,
    pub identity: Arc<dyn IdentityProvider>,
    pub warehouse: Arc<dyn Warehouse>,
    pub watermarks: Arc<WatermarkStore>,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Services {
            api: Arc::new(ApiClient::new(config, ApiBudget::from_config(config))?),
            identity: Arc::new(MicrosoftIdentity::new(config)),
            warehouse: Arc::new(ParquetWarehouse::new(config)),
            watermarks: Arc::new(WatermarkStore::new(config)),
        })
    }
}

/// Runs one pipeline per configured account concurrently against the
/// production services.
pub async fn run_pipelines(
    config: Config,
    window: Window,
    cancel: CancellationToken,
) -> Result<RunSet, Error> {
    let services = Services::from_config(&config)?;
    run_accounts(&config, &window, &services, Utc::now().date_naive(), cancel).await
}

/// Starts one run per account. Runs share the API budget and the warehouse
/// handle, each has its own token manager.
///
/// An account that cannot be set up gets a failed report and the others
/// still run. Errors only when no account is configured.
pub async fn run_accounts(
    config: &Config,
    window: &Window,
    services: &Services,
    today: NaiveDate,
    cancel: CancellationToken,
) -> Result<RunSet, Error> {
    if config.customer_account_ids.is_empty() {
        return Err(Error::Configuration(
            "no customer account ids configured".to_string(),
        ));
    }

    let mut set = RunSet::default();
    let mut runs = JoinSet::new();

    for account_id in &config.customer_account_ids {
        let range = match resolve_range(window, &services.watermarks, account_id, today).await {
            Ok(Some(range)) => range,
            Ok(None) => {
                info!("account {} is up to date, nothing to load", account_id);
                continue;
            }
            Err(e) => {
                set.reports.push(RunReport::setup_failed(
                    account_id,
                    None,
                    Component::Driver,
                    e,
                ));
                continue;
            }
        };

        let tokens = match TokenManager::from_config(config, services.identity.clone()).await {
            Ok(tokens) => Arc::new(tokens),
            Err(e) => {
                set.reports.push(RunReport::setup_failed(
                    account_id,
                    Some(range),
                    Component::TokenManager,
                    e,
                ));
                continue;
            }
        };

        let pipeline = Pipeline::new(
            config,
            account_id,
            tokens,
            services.api.clone(),
            services.warehouse.clone(),
            services.watermarks.clone(),
        );
        let cancel = cancel.clone();
        runs.spawn(async move { pipeline.run(range, &cancel).await });
    }

    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok(report) => set.reports.push(report),
            Err(e) => {
                error!("pipeline task did not complete: {}", e);
                set.aborted += 1;
            }
        }
    }
    set.reports.sort_by(|a, b| a.account_id.cmp(&b.account_id));

    Ok(set)
}

async fn resolve_range(
    window: &Window,
    watermarks: &WatermarkStore,
    account_id: &str,
    today: NaiveDate,
) -> Result<Option<DateRange>, Error> {
    match window {
        Window::Explicit(range) => Ok(Some(*range)),
        Window::Incremental {
            lookback_days,
            initial_start,
        } => {
            let watermark = watermarks.load(account_id).await?;
            incremental_range(watermark.as_ref(), today, *lookback_days, *initial_start)
        }
    }
}
