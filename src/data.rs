use crate::error::Error;
use chrono::{NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    Array, ArrayRef, AsArray, Date32Builder, Decimal128Builder, Float64Builder, Int64Builder,
    RecordBatch, StringArray, StringBuilder,
};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::{
    DataType, Date32Type, Decimal128Type, Field, Float64Type, Int64Type, Schema, SchemaRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Precision of fixed-point currency columns.
pub const MONEY_PRECISION: u8 = 18;
/// Number of fractional digits kept for currency columns.
pub const MONEY_SCALE: i8 = 4;

/// Inclusive range of report dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::StartDateAfterEndDate {
                start_date: start.to_string(),
                end_date: end.to_string(),
            });
        }

        Ok(DateRange { start, end })
    }

    pub fn days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }
}

/// A report row exactly as the vendor delivered it: column name to raw text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRow {
    fields: BTreeMap<String, String>,
}

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RawRow {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Identity of a warehouse row. Ordering follows the partition layout:
/// account first, then date.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub account_id: String,
    pub date: NaiveDate,
    pub campaign_id: String,
    pub ad_group_id: Option<String>,
    pub ad_id: Option<String>,
}

/// One normalized, schema-conformant performance row.
///
/// `cost` and `average_cpc` are fixed-point values scaled by
/// 10^[`MONEY_SCALE`].
#[derive(Clone, Debug, PartialEq)]
pub struct WarehouseRecord {
    pub account_id: String,
    pub campaign_id: String,
    pub ad_group_id: Option<String>,
    pub ad_id: Option<String>,
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub conversions: f64,
    pub cost: i128,
    pub currency: Option<String>,
    pub ctr: Option<f64>,
    pub average_cpc: Option<i128>,
}

impl WarehouseRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            account_id: self.account_id.clone(),
            date: self.date,
            campaign_id: self.campaign_id.clone(),
            ad_group_id: self.ad_group_id.clone(),
            ad_id: self.ad_id.clone(),
        }
    }
}

/// Creates the schema of the warehouse table.
///
/// # Returns
/// A [`SchemaRef`] with the dimensional keys first, followed by the metrics.
pub fn warehouse_schema() -> SchemaRef {
    let money = DataType::Decimal128(MONEY_PRECISION, MONEY_SCALE);
    Arc::new(Schema::new(vec![
        Field::new("account_id", DataType::Utf8, false),
        Field::new("campaign_id", DataType::Utf8, false),
        Field::new("ad_group_id", DataType::Utf8, true),
        Field::new("ad_id", DataType::Utf8, true),
        Field::new("date", DataType::Date32, false),
        Field::new("impressions", DataType::Int64, false),
        Field::new("clicks", DataType::Int64, false),
        Field::new("conversions", DataType::Float64, false),
        Field::new("cost", money.clone(), false),
        Field::new("currency", DataType::Utf8, true),
        Field::new("ctr", DataType::Float64, true),
        Field::new("average_cpc", money, true),
    ]))
}

/// Converts warehouse records into a single [`RecordBatch`] with
/// [`warehouse_schema`].
///
/// # Arguments
/// * `records` - A slice of [`WarehouseRecord`]
///
/// # Returns
/// A Result containing either a [`RecordBatch`] or an [`Error`]
pub fn records_to_batch(records: &[WarehouseRecord]) -> Result<RecordBatch, Error> {
    let num_records = records.len();

    let mut account_id_builder = StringBuilder::with_capacity(num_records, num_records * 8);
    let mut campaign_id_builder = StringBuilder::with_capacity(num_records, num_records * 8);
    let mut ad_group_id_builder = StringBuilder::with_capacity(num_records, num_records * 8);
    let mut ad_id_builder = StringBuilder::with_capacity(num_records, num_records * 8);
    let mut date_builder = Date32Builder::with_capacity(num_records);
    let mut impressions_builder = Int64Builder::with_capacity(num_records);
    let mut clicks_builder = Int64Builder::with_capacity(num_records);
    let mut conversions_builder = Float64Builder::with_capacity(num_records);
    let mut cost_builder = Decimal128Builder::with_capacity(num_records)
        .with_precision_and_scale(MONEY_PRECISION, MONEY_SCALE)?;
    let mut currency_builder = StringBuilder::with_capacity(num_records, num_records * 3);
    let mut ctr_builder = Float64Builder::with_capacity(num_records);
    let mut average_cpc_builder = Decimal128Builder::with_capacity(num_records)
        .with_precision_and_scale(MONEY_PRECISION, MONEY_SCALE)?;

    for record in records {
        account_id_builder.append_value(&record.account_id);
        campaign_id_builder.append_value(&record.campaign_id);
        ad_group_id_builder.append_option(record.ad_group_id.as_deref());
        ad_id_builder.append_option(record.ad_id.as_deref());
        date_builder.append_value(date_to_epoch_days(record.date));
        impressions_builder.append_value(record.impressions);
        clicks_builder.append_value(record.clicks);
        conversions_builder.append_value(record.conversions);
        cost_builder.append_value(record.cost);
        currency_builder.append_option(record.currency.as_deref());
        ctr_builder.append_option(record.ctr);
        average_cpc_builder.append_option(record.average_cpc);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(account_id_builder.finish()),
        Arc::new(campaign_id_builder.finish()),
        Arc::new(ad_group_id_builder.finish()),
        Arc::new(ad_id_builder.finish()),
        Arc::new(date_builder.finish()),
        Arc::new(impressions_builder.finish()),
        Arc::new(clicks_builder.finish()),
        Arc::new(conversions_builder.finish()),
        Arc::new(cost_builder.finish()),
        Arc::new(currency_builder.finish()),
        Arc::new(ctr_builder.finish()),
        Arc::new(average_cpc_builder.finish()),
    ];

    Ok(RecordBatch::try_new(warehouse_schema(), columns)?)
}

/// Reads warehouse records back out of a [`RecordBatch`] produced by a
/// warehouse scan.
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<WarehouseRecord>, Error> {
    let account_ids = utf8_column(batch, "account_id")?;
    let campaign_ids = utf8_column(batch, "campaign_id")?;
    let ad_group_ids = utf8_column(batch, "ad_group_id")?;
    let ad_ids = utf8_column(batch, "ad_id")?;
    let currencies = utf8_column(batch, "currency")?;

    let dates = column(batch, "date")?
        .as_primitive_opt::<Date32Type>()
        .ok_or_else(|| unexpected_type("date"))?;
    let impressions = column(batch, "impressions")?
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| unexpected_type("impressions"))?;
    let clicks = column(batch, "clicks")?
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| unexpected_type("clicks"))?;
    let conversions = column(batch, "conversions")?
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| unexpected_type("conversions"))?;
    let costs = column(batch, "cost")?
        .as_primitive_opt::<Decimal128Type>()
        .ok_or_else(|| unexpected_type("cost"))?;
    let ctrs = column(batch, "ctr")?
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| unexpected_type("ctr"))?;
    let average_cpcs = column(batch, "average_cpc")?
        .as_primitive_opt::<Decimal128Type>()
        .ok_or_else(|| unexpected_type("average_cpc"))?;

    let optional_str = |array: &StringArray, i: usize| {
        array.is_valid(i).then(|| array.value(i).to_string())
    };

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let date = dates
            .value_as_date(i)
            .ok_or_else(|| Error::Load(format!("row {i} has an out-of-range date")))?;

        records.push(WarehouseRecord {
            account_id: account_ids.value(i).to_string(),
            campaign_id: campaign_ids.value(i).to_string(),
            ad_group_id: optional_str(&ad_group_ids, i),
            ad_id: optional_str(&ad_ids, i),
            date,
            impressions: impressions.value(i),
            clicks: clicks.value(i),
            conversions: conversions.value(i),
            cost: costs.value(i),
            currency: optional_str(&currencies, i),
            ctr: ctrs.is_valid(i).then(|| ctrs.value(i)),
            average_cpc: average_cpcs.is_valid(i).then(|| average_cpcs.value(i)),
        });
    }

    Ok(records)
}

pub fn date_to_epoch_days(date: NaiveDate) -> i32 {
    (date - NaiveDateTime::UNIX_EPOCH.date()).num_days() as i32
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, Error> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::Load(format!("warehouse table is missing column '{name}'")))
}

// Parquet scans may surface strings as views or large strings.
fn utf8_column(batch: &RecordBatch, name: &str) -> Result<StringArray, Error> {
    let array = column(batch, name)?;
    let utf8 = if array.data_type() != &DataType::Utf8 {
        cast_with_options(array.as_ref(), &DataType::Utf8, &CastOptions::default())?
    } else {
        array.clone()
    };

    utf8.as_string_opt::<i32>()
        .cloned()
        .ok_or_else(|| unexpected_type(name))
}

fn unexpected_type(name: &str) -> Error {
    Error::Load(format!("warehouse column '{name}' has an unexpected type"))
}

#[cfg(test)]
pub(crate) fn sample_record(campaign_id: &str, date: &str) -> WarehouseRecord {
    WarehouseRecord {
        account_id: "2000".to_string(),
        campaign_id: campaign_id.to_string(),
        ad_group_id: None,
        ad_id: None,
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        impressions: 1000,
        clicks: 100,
        conversions: 10.0,
        cost: 50_1234,
        currency: Some("USD".to_string()),
        ctr: Some(10.0),
        average_cpc: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warehouse_schema() {
        let schema = warehouse_schema();
        assert_eq!(schema.fields().len(), 12);
        assert_eq!(schema.field(0).name(), "account_id");
        assert_eq!(schema.field(4).name(), "date");
        assert_eq!(schema.field(8).name(), "cost");
        assert_eq!(
            schema.field(8).data_type(),
            &DataType::Decimal128(MONEY_PRECISION, MONEY_SCALE)
        );
        assert!(!schema.field(8).is_nullable());
        assert!(schema.field(11).is_nullable());
    }

    #[test]
    fn test_date_to_epoch_days() {
        let date = NaiveDate::from_ymd_opt(2023, 10, 1).unwrap();
        assert_eq!(date_to_epoch_days(date), 19631);
    }

    #[test]
    fn test_records_to_batch_and_back() {
        let mut second = sample_record("789", "2023-10-02");
        second.ad_group_id = Some("55".to_string());
        second.currency = None;
        second.ctr = None;
        second.average_cpc = Some(1_2500);
        let records = vec![sample_record("456", "2023-10-01"), second];

        let batch = records_to_batch(&records).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(9).null_count(), 1);

        assert_eq!(batch_to_records(&batch).unwrap(), records);
    }

    #[test]
    fn test_records_to_batch_empty() {
        let batch = records_to_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema(), warehouse_schema());
    }

    #[test]
    fn test_date_range_rejects_inverted_dates() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert!(matches!(
            DateRange::new(start, end),
            Err(Error::StartDateAfterEndDate { .. })
        ));

        let range = DateRange::new(end, start).unwrap();
        assert_eq!(range.days(), 2);
    }

    #[test]
    fn test_natural_key_ignores_metrics() {
        let a = sample_record("456", "2023-10-01");
        let mut b = a.clone();
        b.clicks = 7;
        assert_eq!(a.natural_key(), b.natural_key());

        b.ad_id = Some("9".to_string());
        assert_ne!(a.natural_key(), b.natural_key());
    }
}
