use std::time::Duration;

use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited by the reporting API: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Network failure: {0}")]
    TransientNetwork(String),

    /// The poll envelope carries only the `Error` status, no code or message.
    #[error("Report job {job_id} failed on the vendor side")]
    VendorJobFailed { job_id: String },

    #[error("Report job {job_id} did not complete within {}s", .waited.as_secs())]
    Timeout { job_id: String, waited: Duration },

    #[error("Run did not finish within {}s", .0.as_secs())]
    RunTimeout(Duration),

    #[error("API rejected the request with status {status}: {message}")]
    VendorRejected { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    Format(String),

    #[error("Warehouse load failed: {0}")]
    Load(String),

    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("{0}")]
    Configuration(String),

    #[error("Run was cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`], reported in run outcomes and used
/// by the driver to decide between retrying and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    TransientNetwork,
    VendorJobFailed,
    Timeout,
    VendorRejected,
    Format,
    Load,
    Configuration,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::RateLimited { .. } => ErrorKind::RateLimit,
            Error::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Error::VendorJobFailed { .. } => ErrorKind::VendorJobFailed,
            Error::Timeout { .. } | Error::RunTimeout(_) => ErrorKind::Timeout,
            Error::VendorRejected { .. } => ErrorKind::VendorRejected,
            Error::Format(_) => ErrorKind::Format,
            Error::Load(_) | Error::DataFusion(_) | Error::Arrow(_) => ErrorKind::Load,
            Error::InvalidDate { .. }
            | Error::StartDateAfterEndDate { .. }
            | Error::UrlParsingFailed(_)
            | Error::Configuration(_) => ErrorKind::Configuration,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the driver may attempt the failed stage again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::RunTimeout(_))
            && matches!(
                self.kind(),
                ErrorKind::RateLimit
                    | ErrorKind::TransientNetwork
                    | ErrorKind::VendorJobFailed
                    | ErrorKind::Timeout
                    | ErrorKind::Load
            )
    }

    /// Delay requested by the vendor before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Error::Format(err.to_string());
        }

        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Error::Authentication(err.to_string())
            }
            Some(status) if status.as_u16() == 429 => Error::RateLimited {
                retry_after: None,
                message: err.to_string(),
            },
            Some(status) if status.is_client_error() && status.as_u16() != 408 => {
                Error::VendorRejected {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            }
            _ => Error::TransientNetwork(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Configuration(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Format(format!("JSON: {err}"))
    }
}
