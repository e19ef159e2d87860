//! Flat-file record storage + HTTP fetch utilities for eotrack.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use eotrack_core::{Record, RecordStore};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "eotrack-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("persisting {path}: {source:#}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// How a load resolved. Every variant still carries a usable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(RecordStore),
    Missing(RecordStore),
    Corrupt { store: RecordStore, reason: String },
}

impl LoadOutcome {
    pub fn store(&self) -> &RecordStore {
        match self {
            LoadOutcome::Loaded(store) | LoadOutcome::Missing(store) => store,
            LoadOutcome::Corrupt { store, .. } => store,
        }
    }

    pub fn into_store(self) -> RecordStore {
        match self {
            LoadOutcome::Loaded(store) | LoadOutcome::Missing(store) => store,
            LoadOutcome::Corrupt { store, .. } => store,
        }
    }

    /// Why the file could not be used, for corrupt loads.
    pub fn corrupt_reason(&self) -> Option<&str> {
        match self {
            LoadOutcome::Corrupt { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }
}

/// A CSV file backing a [`RecordStore`], read and rewritten wholesale.
#[derive(Debug, Clone)]
pub struct CsvStoreFile {
    path: PathBuf,
}

impl CsvStoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file; a missing or unreadable file degrades to an empty store with `default_columns`.
    pub async fn load(&self, default_columns: &[&str]) -> LoadOutcome {
        let empty = || RecordStore::new(default_columns.iter().copied());

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no existing data file");
                return LoadOutcome::Missing(empty());
            }
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "could not read data file");
                return LoadOutcome::Corrupt {
                    store: empty(),
                    reason: err.to_string(),
                };
            }
        };

        match parse_csv(&bytes) {
            Ok(store) if store.columns().is_empty() => {
                debug!(path = %self.path.display(), "data file has no header");
                LoadOutcome::Missing(empty())
            }
            Ok(store) => {
                debug!(path = %self.path.display(), records = store.len(), "parsed data file");
                LoadOutcome::Loaded(store)
            }
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "data file is not valid CSV");
                LoadOutcome::Corrupt {
                    store: empty(),
                    reason: format!("{err:#}"),
                }
            }
        }
    }

    /// Overwrite the file with `store` using a temp file in the same directory and an atomic rename.
    pub async fn persist(&self, store: &RecordStore) -> Result<(), StorageError> {
        self.persist_inner(store)
            .await
            .map_err(|source| StorageError::Persist {
                path: self.path.clone(),
                source,
            })
    }

    async fn persist_inner(&self, store: &RecordStore) -> anyhow::Result<()> {
        let bytes = render_csv(store)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "store persisted");
        Ok(())
    }
}

/// Parse CSV bytes with a header row. Empty cells become nulls.
///
/// Repeated header names get `.1`, `.2`, ... suffixes so no column is lost. A row with more cells
/// than the header is an error.
pub fn parse_csv(bytes: &[u8]) -> anyhow::Result<RecordStore> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = dedupe_headers(
        reader
            .headers()
            .context("reading CSV header")?
            .iter()
            .map(|h| h.trim().to_string()),
    );

    let mut store = RecordStore::new(headers.iter().cloned());
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading CSV row {}", index + 1))?;
        if row.len() > headers.len() {
            bail!(
                "CSV row {} has {} cells but the header has {} columns",
                index + 1,
                row.len(),
                headers.len()
            );
        }
        let mut record = Record::default();
        for (column, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() {
                None
            } else {
                Some(cell.to_string())
            };
            record.set(column, value);
        }
        store.push(record);
    }
    Ok(store)
}

fn dedupe_headers(raw: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut headers = Vec::new();
    for name in raw {
        let mut candidate = name.clone();
        let mut suffix = 1usize;
        while seen.contains(&candidate) {
            candidate = format!("{name}.{suffix}");
            suffix += 1;
        }
        seen.insert(candidate.clone());
        headers.push(candidate);
    }
    headers
}

/// Render `store` as CSV with a header row in schema order.
pub fn render_csv(store: &RecordStore) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(store.columns())
        .context("writing CSV header")?;
    for record in store.records() {
        writer
            .write_record(store.columns().iter().map(|c| record.get(c).unwrap_or("")))
            .context("writing CSV row")?;
    }
    writer.into_inner().context("flushing CSV buffer")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Sequential HTTP client with browser-like headers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Single GET without retries, for callers that own their retry policy.
    pub async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET with exponential backoff on retryable statuses and transport errors.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.fetch_once(url).await {
                Ok(resp) => return Ok(resp),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(url, attempt, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eotrack_core::{COL_CONTENT, COL_LINK, COL_SUMMARY, COL_TITLE, SCRAPER_COLUMNS};
    use tempfile::tempdir;

    fn sample_store() -> RecordStore {
        let mut a = Record::new("Order, with comma", "https://example.gov/a", "April 8, 2025");
        a.content = Some("Line one\nLine \"two\"".to_string());
        a.set("agency", Some("DOJ".to_string()));
        let mut b = Record::new("Second", "https://example.gov/b", "April 9, 2025");
        b.content = None;
        let mut store = RecordStore::with_records(SCRAPER_COLUMNS, vec![a, b]);
        store.ensure_column("agency");
        store
    }

    #[tokio::test]
    async fn missing_file_yields_empty_store_with_default_schema() {
        let dir = tempdir().expect("tempdir");
        let file = CsvStoreFile::new(dir.path().join("absent.csv"));
        let outcome = file.load(&SCRAPER_COLUMNS).await;
        assert!(matches!(outcome, LoadOutcome::Missing(_)));
        assert!(outcome.store().is_empty());
        assert_eq!(outcome.store().columns(), &SCRAPER_COLUMNS);
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_columns_and_nulls() {
        let dir = tempdir().expect("tempdir");
        let file = CsvStoreFile::new(dir.path().join("nested").join("data.csv"));
        let store = sample_store();

        file.persist(&store).await.expect("persist");
        let loaded = file.load(&SCRAPER_COLUMNS).await;
        assert!(loaded.is_loaded());
        let loaded = loaded.into_store();

        assert_eq!(loaded.columns(), store.columns());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.records()[0].get(COL_TITLE), Some("Order, with comma"));
        assert_eq!(loaded.records()[0].get(COL_CONTENT), Some("Line one\nLine \"two\""));
        assert_eq!(loaded.records()[0].get("agency"), Some("DOJ"));
        assert_eq!(loaded.records()[1].get(COL_CONTENT), None);
        assert_eq!(loaded.records()[1].get("agency"), None);
    }

    #[tokio::test]
    async fn persist_overwrites_instead_of_appending() {
        let dir = tempdir().expect("tempdir");
        let file = CsvStoreFile::new(dir.path().join("data.csv"));
        file.persist(&sample_store()).await.expect("first persist");

        let mut smaller = RecordStore::new(SCRAPER_COLUMNS);
        smaller.push(Record::new("Only", "https://example.gov/only", "2025-01-01"));
        smaller.ensure_column(COL_SUMMARY);
        file.persist(&smaller).await.expect("second persist");

        let loaded = file.load(&SCRAPER_COLUMNS).await.into_store();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.records()[0].get(COL_LINK), Some("https://example.gov/only"));
        assert!(loaded.has_column(COL_SUMMARY));
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_empty_store() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, b"title,link\n\"unterminated,https://x\n\xff\xfe").expect("write");
        let outcome = CsvStoreFile::new(&path).load(&SCRAPER_COLUMNS).await;
        match outcome {
            LoadOutcome::Corrupt { store, .. } => {
                assert!(store.is_empty());
                assert_eq!(store.columns(), &SCRAPER_COLUMNS);
            }
            other => panic!("expected corrupt outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persist_into_unwritable_location_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("write");
        let file = CsvStoreFile::new(blocker.join("data.csv"));
        let err = file.persist(&sample_store()).await.expect_err("should fail");
        assert!(matches!(err, StorageError::Persist { .. }));
    }

    #[test]
    fn repeated_headers_keep_every_column() {
        let store = parse_csv(b"title,link,title,title.1\nA,https://x,B,C\n").expect("parse");
        assert_eq!(store.columns(), &["title", "link", "title.1", "title.1.1"]);
        assert_eq!(store.records()[0].get("title"), Some("A"));
        assert_eq!(store.records()[0].get("title.1"), Some("B"));
        assert_eq!(store.records()[0].get("title.1.1"), Some("C"));

        let rendered = render_csv(&store).expect("render");
        assert_eq!(
            String::from_utf8(rendered).expect("utf8"),
            "title,link,title.1,title.1.1\nA,https://x,B,C\n"
        );
    }

    #[test]
    fn rows_longer_than_the_header_are_rejected() {
        let err = parse_csv(b"title,link\nA,https://x,EXTRA,MORE\n").expect_err("should fail");
        assert!(format!("{err:#}").contains("4 cells"));
    }

    #[tokio::test]
    async fn overlong_rows_load_as_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wide.csv");
        std::fs::write(&path, b"title,link\nA,https://x,EXTRA\n").expect("write");
        let outcome = CsvStoreFile::new(&path).load(&SCRAPER_COLUMNS).await;
        assert!(matches!(outcome, LoadOutcome::Corrupt { .. }));
        assert!(outcome.corrupt_reason().is_some_and(|reason| reason.contains("3 cells")));
    }

    #[test]
    fn short_rows_fill_with_nulls() {
        let store = parse_csv(b"title,link,date\nA,https://x\n").expect("parse");
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].get("date"), None);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 502,
            url: "https://example.gov".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }
}
