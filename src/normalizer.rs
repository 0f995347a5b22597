//! Maps vendor report rows onto the warehouse schema.
//!
//! Everything here is pure: a [`RawRow`] either becomes a
//! [`WarehouseRecord`] or a [`RejectReason`]. Accounting across a whole
//! payload lives in [`NormalizedBatch`].

use crate::config::ReportLevel;
use crate::data::{RawRow, WarehouseRecord, MONEY_PRECISION, MONEY_SCALE};
use chrono::NaiveDate;
use datafusion::arrow::compute::kernels::cast_utils::parse_decimal;
use datafusion::arrow::datatypes::Decimal128Type;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Warehouse columns fed by the vendor report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Column {
    AccountId,
    CampaignId,
    AdGroupId,
    AdId,
    Date,
    Impressions,
    Clicks,
    Conversions,
    Cost,
    Currency,
    Ctr,
    AverageCpc,
}

/// Vendor column name to warehouse column, in request order.
const COLUMN_MAP: &[(&str, Column)] = &[
    ("AccountId", Column::AccountId),
    ("CampaignId", Column::CampaignId),
    ("AdGroupId", Column::AdGroupId),
    ("AdId", Column::AdId),
    ("TimePeriod", Column::Date),
    ("Impressions", Column::Impressions),
    ("Clicks", Column::Clicks),
    ("Conversions", Column::Conversions),
    ("Spend", Column::Cost),
    ("CurrencyCode", Column::Currency),
    ("Ctr", Column::Ctr),
    ("AverageCpc", Column::AverageCpc),
];

const NULL_PLACEHOLDER: &str = "--";

/// Why a row could not be turned into a [`WarehouseRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    MissingKey(&'static str),
    InvalidValue { column: &'static str, value: String },
}

impl RejectReason {
    /// Stable label used to aggregate rejections in run reports.
    pub fn label(&self) -> String {
        match self {
            RejectReason::MissingKey(column) => format!("missing_{column}"),
            RejectReason::InvalidValue { column, .. } => format!("invalid_{column}"),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingKey(column) => write!(f, "required column {column} is missing"),
            RejectReason::InvalidValue { column, value } => {
                write!(f, "column {column} has unparsable value '{value}'")
            }
        }
    }
}

/// Vendor columns requested for a report at the given level.
pub fn vendor_columns(level: ReportLevel) -> Vec<&'static str> {
    COLUMN_MAP
        .iter()
        .filter(|(_, column)| match column {
            Column::AdGroupId => level != ReportLevel::Campaign,
            Column::AdId => level == ReportLevel::Ad,
            _ => true,
        })
        .map(|(name, _)| *name)
        .collect()
}

/// Vendor columns in `header` that have no warehouse counterpart.
pub fn unknown_columns<'a>(header: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    header
        .into_iter()
        .filter(|name| !COLUMN_MAP.iter().any(|(vendor, _)| vendor == name))
        .map(str::to_string)
        .collect()
}

/// Maps one vendor row onto the warehouse schema.
///
/// Missing counts default to zero; missing rates and optional attributes
/// become null. Columns not in the mapping are ignored.
pub fn normalize_row(row: &RawRow) -> Result<WarehouseRecord, RejectReason> {
    let account_id = required_text(row, "AccountId", "account_id")?;
    if !is_partition_safe(&account_id) {
        return Err(invalid("account_id", &account_id));
    }
    let campaign_id = required_text(row, "CampaignId", "campaign_id")?;
    let date = match value(row, "TimePeriod") {
        Some(raw) => parse_date(raw).ok_or_else(|| invalid("date", raw))?,
        None => return Err(RejectReason::MissingKey("date")),
    };

    Ok(WarehouseRecord {
        account_id,
        campaign_id,
        ad_group_id: value(row, "AdGroupId").map(str::to_string),
        ad_id: value(row, "AdId").map(str::to_string),
        date,
        impressions: parse_count(row, "Impressions", "impressions")?,
        clicks: parse_count(row, "Clicks", "clicks")?,
        conversions: parse_float(row, "Conversions", "conversions")?.unwrap_or(0.0),
        cost: parse_money(row, "Spend", "cost")?.unwrap_or(0),
        currency: value(row, "CurrencyCode").map(str::to_string),
        ctr: parse_float(row, "Ctr", "ctr")?,
        average_cpc: parse_money(row, "AverageCpc", "average_cpc")?,
    })
}

/// Outcome of normalizing a full payload.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<WarehouseRecord>,
    pub fetched: usize,
    pub rejected: usize,
    pub rejections_by_reason: BTreeMap<String, usize>,
    warned_columns: BTreeSet<String>,
}

impl NormalizedBatch {
    /// Normalizes `row` and records the outcome.
    pub fn push(&mut self, row: &RawRow) {
        let index = self.fetched;
        self.fetched += 1;

        for column in unknown_columns(row.columns()) {
            if self.warned_columns.insert(column.clone()) {
                warn!("dropping unknown report column '{}'", column);
            }
        }

        match normalize_row(row) {
            Ok(record) => self.records.push(record),
            Err(reason) => {
                warn!("rejecting report row {}: {}", index, reason);
                self.rejected += 1;
                *self.rejections_by_reason.entry(reason.label()).or_default() += 1;
            }
        }
    }

    pub fn normalized(&self) -> usize {
        self.records.len()
    }

    pub fn into_records(self) -> Vec<WarehouseRecord> {
        self.records
    }
}

fn value<'a>(row: &'a RawRow, column: &str) -> Option<&'a str> {
    row.get(column)
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != NULL_PLACEHOLDER)
}

fn invalid(column: &'static str, raw: &str) -> RejectReason {
    RejectReason::InvalidValue {
        column,
        value: raw.to_string(),
    }
}

fn required_text(
    row: &RawRow,
    vendor: &str,
    column: &'static str,
) -> Result<String, RejectReason> {
    value(row, vendor)
        .map(str::to_string)
        .ok_or(RejectReason::MissingKey(column))
}

/// Account ids name warehouse partition files.
fn is_partition_safe(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

fn numeric(raw: &str) -> String {
    raw.replace(',', "")
}

fn parse_count(row: &RawRow, vendor: &str, column: &'static str) -> Result<i64, RejectReason> {
    match value(row, vendor) {
        None => Ok(0),
        Some(raw) => numeric(raw)
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .ok_or_else(|| invalid(column, raw)),
    }
}

fn parse_float(
    row: &RawRow,
    vendor: &str,
    column: &'static str,
) -> Result<Option<f64>, RejectReason> {
    match value(row, vendor) {
        None => Ok(None),
        Some(raw) => numeric(raw.trim_end_matches('%'))
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(column, raw)),
    }
}

fn parse_money(
    row: &RawRow,
    vendor: &str,
    column: &'static str,
) -> Result<Option<i128>, RejectReason> {
    match value(row, vendor) {
        None => Ok(None),
        Some(raw) => parse_decimal::<Decimal128Type>(&numeric(raw), MONEY_PRECISION, MONEY_SCALE)
            .map(Some)
            .map_err(|_| invalid(column, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs.iter().copied().collect()
    }

    fn full_row() -> RawRow {
        row(&[
            ("AccountId", "2000"),
            ("CampaignId", "456"),
            ("AdGroupId", "77"),
            ("AdId", "88"),
            ("TimePeriod", "2024-03-01"),
            ("Impressions", "1,234"),
            ("Clicks", "56"),
            ("Conversions", "2.50"),
            ("Spend", "12.3456"),
            ("CurrencyCode", "USD"),
            ("Ctr", "4.54%"),
            ("AverageCpc", "0.22"),
        ])
    }

    #[test]
    fn test_normalize_full_row() {
        let record = normalize_row(&full_row()).unwrap();
        assert_eq!(record.account_id, "2000");
        assert_eq!(record.ad_group_id.as_deref(), Some("77"));
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(record.impressions, 1234);
        assert_eq!(record.clicks, 56);
        assert_eq!(record.conversions, 2.5);
        assert_eq!(record.cost, 12_3456);
        assert_eq!(record.ctr, Some(4.54));
        assert_eq!(record.average_cpc, Some(2200));
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let record = normalize_row(&row(&[
            ("AccountId", "2000"),
            ("CampaignId", "456"),
            ("TimePeriod", "3/1/2024"),
            ("Ctr", "--"),
            ("Clicks", ""),
        ]))
        .unwrap();

        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(record.impressions, 0);
        assert_eq!(record.clicks, 0);
        assert_eq!(record.conversions, 0.0);
        assert_eq!(record.cost, 0);
        assert_eq!(record.ctr, None);
        assert_eq!(record.average_cpc, None);
        assert_eq!(record.currency, None);
        assert_eq!(record.ad_id, None);
    }

    #[test]
    fn test_missing_date_is_rejected() {
        let full = full_row();
        let without_date: RawRow = full
            .columns()
            .filter(|c| *c != "TimePeriod")
            .map(|c| (c, full.get(c).unwrap()))
            .collect();

        assert_eq!(
            normalize_row(&without_date),
            Err(RejectReason::MissingKey("date"))
        );
    }

    #[test]
    fn test_account_id_with_path_characters_is_rejected() {
        for account_id in ["../2000", "20/00", "2000.parquet"] {
            let bad = row(&[
                ("AccountId", account_id),
                ("CampaignId", "456"),
                ("TimePeriod", "2024-03-01"),
            ]);
            assert_eq!(
                normalize_row(&bad).unwrap_err().label(),
                "invalid_account_id"
            );
        }
    }

    #[test]
    fn test_unparsable_values_are_rejected() {
        let bad = row(&[
            ("AccountId", "2000"),
            ("CampaignId", "456"),
            ("TimePeriod", "2024-03-01"),
            ("Impressions", "many"),
        ]);
        assert_eq!(
            normalize_row(&bad).unwrap_err().label(),
            "invalid_impressions"
        );

        let bad_date = row(&[
            ("AccountId", "2000"),
            ("CampaignId", "456"),
            ("TimePeriod", "2024-13-01"),
        ]);
        assert!(matches!(
            normalize_row(&bad_date),
            Err(RejectReason::InvalidValue { column: "date", .. })
        ));
    }

    #[test]
    fn test_unknown_columns() {
        let unknown = unknown_columns(["AccountId", "QualityScore", "Spend", "Network"]);
        assert_eq!(unknown, vec!["QualityScore", "Network"]);
    }

    #[test]
    fn test_vendor_columns_per_level() {
        let campaign = vendor_columns(ReportLevel::Campaign);
        assert!(!campaign.contains(&"AdGroupId"));
        assert!(!campaign.contains(&"AdId"));
        assert!(campaign.contains(&"TimePeriod"));

        let ad_group = vendor_columns(ReportLevel::AdGroup);
        assert!(ad_group.contains(&"AdGroupId"));
        assert!(!ad_group.contains(&"AdId"));

        assert_eq!(vendor_columns(ReportLevel::Ad).len(), COLUMN_MAP.len());
    }

    #[test]
    fn test_batch_accounting() {
        let mut batch = NormalizedBatch::default();
        batch.push(&full_row());
        batch.push(&row(&[("AccountId", "2000"), ("TimePeriod", "2024-03-01")]));
        batch.push(&row(&[
            ("AccountId", "2000"),
            ("CampaignId", "1"),
            ("TimePeriod", "2024-03-01"),
            ("Extra", "x"),
        ]));

        assert_eq!(batch.fetched, 3);
        assert_eq!(batch.normalized(), 2);
        assert_eq!(batch.rejected, 1);
        assert_eq!(batch.rejections_by_reason.get("missing_campaign_id"), Some(&1));
        assert_eq!(batch.rejected + batch.normalized(), batch.fetched);
    }
}
