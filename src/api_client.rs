use crate::config::{Config, ReportLevel};
use crate::data::DateRange;
use crate::error::Error;
use crate::normalizer::vendor_columns;
use crate::rate_limit::ApiBudget;
use chrono::Datelike;
use log::{debug, error};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const RATE_LIMIT_ERROR_CODE: &str = "CallRateExceeded";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReportingApi: Send + Sync + 'static {
    /// Submits a report generation job.
    /// # Arguments
    /// * `access_token` - A valid OAuth bearer token.
    /// * `request` - Account, date range and columns of the report.
    /// # Returns
    /// A Result containing either the vendor's job id or an Error.
    async fn submit_report(
        &self,
        access_token: &str,
        request: &ReportRequest,
    ) -> Result<String, Error>;

    /// Checks the status of a previously submitted job.
    /// # Arguments
    /// * `access_token` - A valid OAuth bearer token.
    /// * `job_id` - The id returned by [`ReportingApi::submit_report`].
    /// # Returns
    /// A Result containing either the [`PollResponse`] or an Error.
    async fn poll_report(&self, access_token: &str, job_id: &str) -> Result<PollResponse, Error>;

    /// Downloads the raw result referenced by a succeeded job.
    async fn download(&self, uri: &str) -> Result<Vec<u8>, Error>;
}

/// What to report on: one account, one date range, the columns of one
/// report level.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportRequest {
    pub account_id: String,
    pub date_range: DateRange,
    pub level: ReportLevel,
}

impl ReportRequest {
    pub fn columns(&self) -> Vec<&'static str> {
        vendor_columns(self.level)
    }

    fn report_type(&self) -> &'static str {
        match self.level {
            ReportLevel::Campaign => "CampaignPerformanceReportRequest",
            ReportLevel::AdGroup => "AdGroupPerformanceReportRequest",
            ReportLevel::Ad => "AdPerformanceReportRequest",
        }
    }

    /// The `ReportRequest` body understood by the Submit operation.
    pub fn to_body(&self) -> serde_json::Value {
        let day = |date: chrono::NaiveDate| {
            json!({ "Day": date.day(), "Month": date.month(), "Year": date.year() })
        };

        json!({
            "ReportRequest": {
                "Type": self.report_type(),
                "ReportName": format!(
                    "{}-{}-{}",
                    self.account_id, self.date_range.start, self.date_range.end
                ),
                "Format": "Csv",
                "FormatVersion": "2.0",
                "ExcludeColumnHeaders": false,
                "ExcludeReportHeader": true,
                "ExcludeReportFooter": true,
                "ReturnOnlyCompleteData": false,
                "Aggregation": "Daily",
                "Columns": self.columns(),
                "Scope": { "AccountIds": [self.account_id] },
                "Time": {
                    "CustomDateRangeStart": day(self.date_range.start),
                    "CustomDateRangeEnd": day(self.date_range.end),
                },
            }
        })
    }
}

/// Vendor-side state of a report job as reported by a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VendorStatus {
    Pending,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollResponse {
    pub status: VendorStatus,
    pub download_url: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    developer_token: String,
    customer_id: String,
    budget: ApiBudget,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubmitResponse {
    report_request_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PollEnvelope {
    report_request_status: ReportRequestStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportRequestStatus {
    status: String,
    report_download_url: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ApiFault {
    operation_errors: Vec<OperationError>,
    batch_errors: Vec<OperationError>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct OperationError {
    code: i64,
    error_code: String,
    message: String,
}

impl ApiClient {
    pub fn new(config: &Config, budget: ApiBudget) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(ApiClient {
            client,
            base_url: config.reporting_api_url.to_string(),
            developer_token: config.developer_token.to_string(),
            customer_id: config.customer_id.to_string(),
            budget,
        })
    }

    fn operation_url(&self, operation: &str) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&["GenerateReport", operation]);
        Ok(url)
    }

    async fn post(
        &self,
        operation: &str,
        access_token: &str,
        account_id: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<Response, Error> {
        let url = self.operation_url(operation)?;
        let _permit = self.budget.acquire().await?;

        let mut request = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .header("DeveloperToken", &self.developer_token)
            .header("CustomerId", &self.customer_id)
            .json(body);
        if let Some(account_id) = account_id {
            request = request.header("CustomerAccountId", account_id);
        }

        let resp = request.send().await?;
        check_status(resp).await
    }
}

#[async_trait::async_trait]
impl ReportingApi for ApiClient {
    async fn submit_report(
        &self,
        access_token: &str,
        request: &ReportRequest,
    ) -> Result<String, Error> {
        let resp = self
            .post(
                "Submit",
                access_token,
                Some(&request.account_id),
                &request.to_body(),
            )
            .await?;

        let submitted: SubmitResponse = resp.json().await?;
        debug!(
            "submitted report {} for account {}",
            submitted.report_request_id, request.account_id
        );
        Ok(submitted.report_request_id)
    }

    async fn poll_report(&self, access_token: &str, job_id: &str) -> Result<PollResponse, Error> {
        let resp = self
            .post(
                "Poll",
                access_token,
                None,
                &json!({ "ReportRequestId": job_id }),
            )
            .await?;

        let envelope: PollEnvelope = resp.json().await?;
        let status = parse_vendor_status(&envelope.report_request_status.status)?;
        Ok(PollResponse {
            status,
            download_url: envelope.report_request_status.report_download_url,
        })
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>, Error> {
        let url = Url::parse(uri)?;
        let _permit = self.budget.acquire().await?;

        let resp = check_status(self.client.get(url).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

fn parse_vendor_status(status: &str) -> Result<VendorStatus, Error> {
    match status {
        "Pending" => Ok(VendorStatus::Pending),
        "Success" => Ok(VendorStatus::Success),
        "Error" => Ok(VendorStatus::Error),
        other => Err(Error::Format(format!("unknown report status '{other}'"))),
    }
}

async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    let err = map_failure(status, retry_after, &body);
    error!("reporting API responded with {}: {}", status, err);
    Err(err)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success response onto the error taxonomy.
fn map_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Error {
    let fault: ApiFault = serde_json::from_str(body).unwrap_or_default();
    let first = fault
        .operation_errors
        .iter()
        .chain(fault.batch_errors.iter())
        .next();

    let message = match first {
        Some(e) => format!("{} ({}): {}", e.error_code, e.code, e.message),
        None if body.is_empty() => status.to_string(),
        None => body.chars().take(512).collect(),
    };

    let rate_limited = first.is_some_and(|e| e.error_code == RATE_LIMIT_ERROR_CODE);
    if status == StatusCode::TOO_MANY_REQUESTS || rate_limited {
        return Error::RateLimited {
            retry_after,
            message,
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication(message),
        StatusCode::REQUEST_TIMEOUT => Error::TransientNetwork(message),
        s if s.is_server_error() => Error::TransientNetwork(message),
        s => Error::VendorRejected {
            status: s.as_u16(),
            message,
        },
    }
}
