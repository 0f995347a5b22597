use crate::api_client::{ReportRequest, ReportingApi, VendorStatus};
use crate::config::Config;
use crate::data::DateRange;
use crate::error::Error;
use crate::token_manager::TokenManager;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    fn can_become(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => true,
            JobStatus::Running => next != JobStatus::Pending,
            JobStatus::Succeeded | JobStatus::Failed => false,
        }
    }
}

impl From<VendorStatus> for JobStatus {
    fn from(status: VendorStatus) -> Self {
        match status {
            VendorStatus::Pending => JobStatus::Running,
            VendorStatus::Success => JobStatus::Succeeded,
            VendorStatus::Error => JobStatus::Failed,
        }
    }
}

/// One submitted report job. Jobs are never resumed: a retry submits a new
/// one.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportJob {
    pub job_id: String,
    pub account_id: String,
    pub date_range: DateRange,
    pub requested_columns: Vec<&'static str>,
    pub status: JobStatus,
    /// Download location; `None` on a succeeded job means the report is empty.
    pub result_uri: Option<String>,
}

impl ReportJob {
    fn submitted(job_id: String, request: &ReportRequest) -> Self {
        ReportJob {
            job_id,
            account_id: request.account_id.clone(),
            date_range: request.date_range,
            requested_columns: request.columns(),
            status: JobStatus::Pending,
            result_uri: None,
        }
    }

    fn advance(&mut self, next: JobStatus, result_uri: Option<String>) -> Result<(), Error> {
        if !self.status.can_become(next) {
            return Err(Error::Format(format!(
                "report job {} moved from {:?} to {:?}",
                self.job_id, self.status, next
            )));
        }

        if next != self.status {
            debug!("report job {}: {:?} -> {:?}", self.job_id, self.status, next);
        }
        self.status = next;
        self.result_uri = result_uri;
        Ok(())
    }
}

/// Backoff schedule for status checks.
#[derive(Clone, Copy, Debug)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &Config) -> Self {
        PollPolicy {
            initial: Duration::from_secs(config.poll_initial_secs),
            max: Duration::from_secs(config.poll_max_secs),
            timeout: Duration::from_secs(config.poll_timeout_secs),
        }
    }

    /// Delay before status check number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(1 << attempt.min(16))
            .min(self.max)
    }
}

/// Submits report jobs and waits for them to reach a terminal state.
pub struct ReportRequestor {
    api: Arc<dyn ReportingApi>,
    tokens: Arc<TokenManager>,
    policy: PollPolicy,
}

impl ReportRequestor {
    pub fn new(api: Arc<dyn ReportingApi>, tokens: Arc<TokenManager>, policy: PollPolicy) -> Self {
        ReportRequestor {
            api,
            tokens,
            policy,
        }
    }

    /// Submits `request` and polls until the job succeeds.
    ///
    /// # Returns
    /// The succeeded [`ReportJob`], or [`Error::VendorJobFailed`] when the
    /// vendor reports failure, [`Error::Timeout`] when the poll deadline
    /// passes, [`Error::Cancelled`] when `cancel` fires while waiting.
    pub async fn request(
        &self,
        request: &ReportRequest,
        cancel: &CancellationToken,
    ) -> Result<ReportJob, Error> {
        let token = self.tokens.get_valid_token().await?;
        let job_id = self.api.submit_report(&token, request).await?;
        let mut job = ReportJob::submitted(job_id, request);
        info!(
            "submitted report job {} for account {} ({} to {})",
            job.job_id, job.account_id, job.date_range.start, job.date_range.end
        );

        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut attempt = 0;

        loop {
            let token = self.tokens.get_valid_token().await?;
            let polled = self.api.poll_report(&token, &job.job_id).await?;
            job.advance(polled.status.into(), polled.download_url)?;

            match job.status {
                JobStatus::Succeeded => {
                    info!(
                        "report job {} succeeded after {} polls in {}s",
                        job.job_id,
                        attempt + 1,
                        started.elapsed().as_secs()
                    );
                    return Ok(job);
                }
                JobStatus::Failed => {
                    warn!("report job {} failed on the vendor side", job.job_id);
                    return Err(Error::VendorJobFailed { job_id: job.job_id });
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    job_id: job.job_id,
                    waited: now - started,
                });
            }

            let delay = self.policy.delay(attempt).min(deadline - now);
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopped polling report job {}", job.job_id);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
