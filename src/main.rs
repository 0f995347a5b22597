mod api_client;
mod config;
mod data;
mod error;
mod normalizer;
mod payload_fetcher;
mod rate_limit;
mod report_requestor;
mod runner;
mod token_manager;
mod warehouse;
mod watermark;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use data::DateRange;
use error::Error;
use log::{error, info, warn};
use runner::Window;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load an explicit, inclusive date range.
    Fetch {
        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: NaiveDate,

        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: NaiveDate,
    },
    /// Load everything after each account's watermark through yesterday.
    Incremental {
        #[arg(long, default_value_t = 0, help = "Days before the watermark to reload")]
        lookback_days: u64,

        #[arg(
            long,
            help = "First date to load for accounts without a watermark, YYYY-MM-DD",
            value_parser = validate_date
        )]
        initial_start: Option<NaiveDate>,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    let window = match args.command {
        Command::Fetch { start, end } => Window::Explicit(DateRange::new(start, end)?),
        Command::Incremental {
            lookback_days,
            initial_start,
        } => Window::Incremental {
            lookback_days,
            initial_start,
        },
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling runs");
            on_signal.cancel();
        }
    });

    let runs = match runner::run_pipelines(args.config, window, cancel).await {
        Ok(runs) => runs,
        Err(err) => {
            error!("failed to start runs: {}", err);
            std::process::exit(1);
        }
    };

    for report in &runs.reports {
        println!("{}", serde_json::to_string(report)?);
    }
    info!(
        "{} run(s) finished, {} aborted",
        runs.reports.len(),
        runs.aborted
    );

    if !runs.succeeded() {
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_date() {
        assert_eq!(
            validate_date("2024-03-01"),
            Ok(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(validate_date("2024-02-30").is_err());
        assert!(validate_date("2024-13-01").is_err());
        assert!(validate_date("03/01/2024").is_err());
    }

    #[test]
    fn test_parse_incremental_command() {
        let args = Args::try_parse_from([
            "ads-report-loader",
            "--client-id",
            "client",
            "--client-secret",
            "secret",
            "--developer-token",
            "dev",
            "--customer-id",
            "1000",
            "--customer-account-ids",
            "2000,3000",
            "incremental",
            "--lookback-days",
            "3",
        ])
        .unwrap();

        assert_eq!(args.config.customer_account_ids, vec!["2000", "3000"]);
        match args.command {
            Command::Incremental {
                lookback_days,
                initial_start,
            } => {
                assert_eq!(lookback_days, 3);
                assert_eq!(initial_start, None);
            }
            Command::Fetch { .. } => panic!("Expected incremental command"),
        }
    }
}
