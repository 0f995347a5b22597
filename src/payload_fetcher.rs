use crate::api_client::ReportingApi;
use crate::data::RawRow;
use crate::error::Error;
use crate::report_requestor::{JobStatus, ReportJob};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use std::io::{Cursor, Read};
use std::sync::Arc;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const EMPTY_ZIP_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BOM: char = '\u{feff}';

/// A downloaded, decompressed report. Each page is one CSV document with its
/// own header line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Payload {
    pages: Vec<Vec<u8>>,
}

impl Payload {
    /// A report the vendor produced no file for.
    pub fn empty() -> Self {
        Payload::default()
    }

    /// Detects the container format of `bytes` and splits it into pages.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::Format("report download was empty".to_string()));
        }

        let pages = if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(EMPTY_ZIP_MAGIC) {
            unzip(bytes)?
        } else if bytes.starts_with(GZIP_MAGIC) {
            let mut page = Vec::new();
            MultiGzDecoder::new(bytes.as_slice())
                .read_to_end(&mut page)
                .map_err(|e| Error::Format(format!("corrupt gzip payload: {e}")))?;
            vec![page]
        } else if std::str::from_utf8(&bytes).is_ok() {
            vec![bytes]
        } else {
            return Err(Error::Format(
                "report payload is neither an archive nor UTF-8 text".to_string(),
            ));
        };

        Ok(Payload { pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Lazily yields the rows of every page, in page order.
    ///
    /// Iteration stops after the first error. Calling `rows` again starts
    /// over from the first page.
    pub fn rows(&self) -> RawRows<'_> {
        RawRows {
            pages: self.pages.iter(),
            page_index: 0,
            header: None,
            current: None,
            failed: false,
        }
    }
}

fn unzip(bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Format(format!("corrupt zip payload: {e}")))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::Format(format!("corrupt zip entry {i}: {e}")))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| Error::Format(format!("failed to inflate {name}: {e}")))?;
        entries.push((name, contents));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    debug!("report archive holds {} file(s)", entries.len());
    Ok(entries.into_iter().map(|(_, contents)| contents).collect())
}

/// Iterator over the rows of a [`Payload`].
pub struct RawRows<'a> {
    pages: std::slice::Iter<'a, Vec<u8>>,
    page_index: usize,
    header: Option<Vec<String>>,
    current: Option<csv::StringRecordsIntoIter<&'a [u8]>>,
    failed: bool,
}

impl<'a> RawRows<'a> {
    /// Opens the next page, checking its header against the first page's.
    /// Returns `Ok(None)` for a page with no content at all.
    fn open(
        &mut self,
        page: &'a [u8],
    ) -> Result<Option<csv::StringRecordsIntoIter<&'a [u8]>>, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(page);

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| {
                Error::Format(format!("page {} has an unreadable header: {e}", self.page_index))
            })?
            .iter()
            .map(|name| name.trim_start_matches(BOM).trim().to_string())
            .collect();

        if header.iter().all(String::is_empty) {
            return Ok(None);
        }

        match &self.header {
            Some(expected) if *expected != header => {
                return Err(Error::Format(format!(
                    "page {} header {:?} differs from {:?}",
                    self.page_index, header, expected
                )));
            }
            Some(_) => {}
            None => self.header = Some(header),
        }

        Ok(Some(reader.into_records()))
    }
}

impl Iterator for RawRows<'_> {
    type Item = Result<RawRow, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }

            if let Some(records) = self.current.as_mut() {
                match records.next() {
                    Some(Ok(record)) => {
                        let header = self.header.as_deref().unwrap_or_default();
                        return Some(Ok(header
                            .iter()
                            .map(String::as_str)
                            .zip(record.iter())
                            .collect()));
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(Error::Format(format!(
                            "page {} is malformed: {e}",
                            self.page_index
                        ))));
                    }
                    None => {
                        self.current = None;
                        self.page_index += 1;
                    }
                }
            }

            let page = self.pages.next()?;
            match self.open(page) {
                Ok(Some(records)) => self.current = Some(records),
                Ok(None) => self.page_index += 1,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Downloads and decodes the result of a succeeded [`ReportJob`].
pub struct PayloadFetcher {
    api: Arc<dyn ReportingApi>,
}

impl PayloadFetcher {
    pub fn new(api: Arc<dyn ReportingApi>) -> Self {
        PayloadFetcher { api }
    }

    pub async fn fetch(&self, job: &ReportJob) -> Result<Payload, Error> {
        if job.status != JobStatus::Succeeded {
            return Err(Error::Format(format!(
                "report job {} is {:?}, not succeeded",
                job.job_id, job.status
            )));
        }

        let Some(uri) = &job.result_uri else {
            info!("report job {} produced no data", job.job_id);
            return Ok(Payload::empty());
        };

        let bytes = self.api.download(uri).await?;
        let size = bytes.len();
        let payload = Payload::decode(bytes)?;
        info!(
            "downloaded report job {}: {} bytes in {} page(s)",
            job.job_id,
            size,
            payload.page_count()
        );
        Ok(payload)
    }
}

#[cfg(test)]
pub(crate) fn zip_pages(pages: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in pages {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::MockReportingApi;
    use crate::data::DateRange;
    use chrono::NaiveDate;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const HEADER: &str = "AccountId,CampaignId,TimePeriod,Clicks\n";

    fn job(result_uri: Option<&str>) -> ReportJob {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ReportJob {
            job_id: "job-1".to_string(),
            account_id: "2000".to_string(),
            date_range: DateRange::new(day, day).unwrap(),
            requested_columns: vec!["AccountId", "CampaignId", "TimePeriod", "Clicks"],
            status: JobStatus::Succeeded,
            result_uri: result_uri.map(str::to_string),
        }
    }

    fn collect(payload: &Payload) -> Result<Vec<RawRow>, Error> {
        payload.rows().collect()
    }

    #[test]
    fn test_zip_pages_are_concatenated_in_name_order() {
        let second = format!("{HEADER}2000,2,2024-03-02,7\n");
        let first = format!("\u{feff}{HEADER}2000,1,2024-03-01,5\n2000,1,2024-03-02,6\n");
        let payload =
            Payload::decode(zip_pages(&[("part-2.csv", &second), ("part-1.csv", &first)]))
                .unwrap();

        assert_eq!(payload.page_count(), 2);
        let rows = collect(&payload).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("AccountId"), Some("2000"));
        assert_eq!(rows[0].get("Clicks"), Some("5"));
        assert_eq!(rows[2].get("CampaignId"), Some("2"));
    }

    #[test]
    fn test_rows_restart_from_the_beginning() {
        let page = format!("{HEADER}2000,1,2024-03-01,5\n2000,1,2024-03-02,6\n");
        let payload = Payload::decode(page.into_bytes()).unwrap();

        let mut rows = payload.rows();
        rows.next().unwrap().unwrap();
        drop(rows);

        assert_eq!(collect(&payload).unwrap().len(), 2);
    }

    #[test]
    fn test_gzip_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(format!("{HEADER}2000,1,2024-03-01,5\n").as_bytes())
            .unwrap();
        let payload = Payload::decode(encoder.finish().unwrap()).unwrap();
        assert_eq!(collect(&payload).unwrap().len(), 1);
    }

    #[test]
    fn test_header_only_page_has_no_rows() {
        let payload = Payload::decode(zip_pages(&[("r.csv", HEADER), ("s.csv", "")])).unwrap();
        assert!(collect(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payloads_are_format_errors() {
        assert!(matches!(Payload::decode(vec![]), Err(Error::Format(_))));
        assert!(matches!(
            Payload::decode(b"PK\x03\x04garbage".to_vec()),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            Payload::decode(vec![0xff, 0xfe, 0x00]),
            Err(Error::Format(_))
        ));

        let ragged = format!("{HEADER}2000,1\n");
        let payload = Payload::decode(ragged.into_bytes()).unwrap();
        assert!(matches!(collect(&payload), Err(Error::Format(_))));
    }

    #[test]
    fn test_mismatched_page_headers_are_format_errors() {
        let other = "AccountId,Spend\n2000,1.0\n";
        let first = format!("{HEADER}2000,1,2024-03-01,5\n");
        let payload = Payload::decode(zip_pages(&[("a.csv", &first), ("b.csv", other)])).unwrap();

        let results: Vec<_> = payload.rows().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Format(_))));
    }

    #[tokio::test]
    async fn test_fetch_without_result_uri_is_empty() {
        let mut api = MockReportingApi::new();
        api.expect_download().never();

        let fetcher = PayloadFetcher::new(Arc::new(api));
        let payload = fetcher.fetch(&job(None)).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(payload.rows().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_downloads_result_uri() {
        let archive = zip_pages(&[("report.csv", "AccountId,CampaignId\n2000,1\n")]);
        let mut api = MockReportingApi::new();
        api.expect_download()
            .withf(|uri| uri == "https://dl/report.zip")
            .times(1)
            .returning(move |_| Ok(archive.clone()));

        let fetcher = PayloadFetcher::new(Arc::new(api));
        let payload = fetcher
            .fetch(&job(Some("https://dl/report.zip")))
            .await
            .unwrap();
        assert_eq!(collect(&payload).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_propagates_transient_download_failure() {
        let mut api = MockReportingApi::new();
        api.expect_download()
            .returning(|_| Err(Error::TransientNetwork("connection reset".into())));

        let fetcher = PayloadFetcher::new(Arc::new(api));
        let err = fetcher.fetch(&job(Some("https://dl/x"))).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
