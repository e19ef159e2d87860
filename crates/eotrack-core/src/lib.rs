//! Core record model for executive-action datasets.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "eotrack-core";

pub const COL_TITLE: &str = "title";
pub const COL_LINK: &str = "link";
pub const COL_DATE: &str = "date";
pub const COL_PAGE_NUMBER: &str = "page_number";
pub const COL_CONTENT: &str = "content";
pub const COL_SUMMARY: &str = "summary";

/// Schema used when the scraper starts from an empty dataset.
pub const SCRAPER_COLUMNS: [&str; 5] = [COL_TITLE, COL_LINK, COL_DATE, COL_PAGE_NUMBER, COL_CONTENT];

/// Columns an input file must carry before it can be summarized.
pub const SUMMARIZER_REQUIRED_COLUMNS: [&str; 3] = [COL_TITLE, COL_DATE, COL_CONTENT];

pub const CONTENT_FETCH_FAILED: &str = "Error fetching content";
pub const NO_CONTENT_FOUND: &str = "No content found";
/// Written for listing items without a link; no fetch is attempted.
pub const NO_CONTENT: &str = "No content";
pub const SUMMARY_FAILED: &str = "Error generating summary.";

pub const NO_TITLE: &str = "No title";
pub const NO_LINK: &str = "No link";
pub const NO_DATE: &str = "No date";

/// Placeholder values written in place of a real enrichment result.
pub fn is_sentinel(value: &str) -> bool {
    matches!(
        value.trim(),
        CONTENT_FETCH_FAILED | NO_CONTENT_FOUND | NO_CONTENT | SUMMARY_FAILED
    )
}

/// One executive action. Known columns are typed fields; anything else lands in `extra`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub title: Option<String>,
    pub link: Option<String>,
    pub date: Option<String>,
    pub page_number: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn new(title: impl Into<String>, link: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            link: Some(link.into()),
            date: Some(date.into()),
            ..Default::default()
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        match column {
            COL_TITLE => self.title.as_deref(),
            COL_LINK => self.link.as_deref(),
            COL_DATE => self.date.as_deref(),
            COL_PAGE_NUMBER => self.page_number.as_deref(),
            COL_CONTENT => self.content.as_deref(),
            COL_SUMMARY => self.summary.as_deref(),
            other => self.extra.get(other).and_then(|v| v.as_deref()),
        }
    }

    pub fn set(&mut self, column: &str, value: Option<String>) {
        match column {
            COL_TITLE => self.title = value,
            COL_LINK => self.link = value,
            COL_DATE => self.date = value,
            COL_PAGE_NUMBER => self.page_number = value,
            COL_CONTENT => self.content = value,
            COL_SUMMARY => self.summary = value,
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    /// Count of enrichment fields holding a genuine (non-blank, non-sentinel) value.
    pub fn enrichment_rank(&self) -> usize {
        [self.content.as_deref(), self.summary.as_deref()]
            .into_iter()
            .filter(|v| is_genuine(*v))
            .count()
    }
}

fn is_genuine(value: Option<&str>) -> bool {
    match value {
        Some(v) => !v.trim().is_empty() && !is_sentinel(v),
        None => false,
    }
}

/// Ordered columns plus ordered records, loaded and persisted as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordStore {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self::default();
        for column in columns {
            store.ensure_column(&column.into());
        }
        store
    }

    pub fn with_records<I, S>(columns: I, records: Vec<Record>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self::new(columns);
        store.records = records;
        store
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Appends `column` to the schema if absent. Returns true when it was added.
    pub fn ensure_column(&mut self, column: &str) -> bool {
        if self.has_column(column) {
            return false;
        }
        self.columns.push(column.to_string());
        true
    }

    /// Sets `column` to `value` on every record, adding it to the schema if needed.
    pub fn fill_column(&mut self, column: &str, value: Option<String>) {
        self.ensure_column(column);
        for record in &mut self.records {
            record.set(column, value.clone());
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Row view in schema order; `None` marks a null cell.
    pub fn row(&self, index: usize) -> Option<Vec<Option<&str>>> {
        let record = self.records.get(index)?;
        Some(self.columns.iter().map(|c| record.get(c)).collect())
    }
}

const DATE_FORMATS: [&str; 15] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%m-%d-%Y",
    "%m.%d.%Y",
    "%d.%m.%Y",
    "%d-%b-%y",
    "%d-%B-%y",
    "%d-%b-%Y",
    "%d-%B-%Y",
];

/// Best-effort parse of the date strings found on listing pages and in prior files.
pub fn parse_action_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ts| ts.date())
}

/// Rewrites a parsable date as `MM/DD/YYYY`; unparsable input yields `None`.
pub fn standardize_date(raw: &str) -> Option<String> {
    parse_action_date(raw).map(|d| d.format("%m/%d/%Y").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_get_and_set_route_unknown_columns_to_extra() {
        let mut record = Record::new("EO 1", "https://example.gov/eo-1", "January 20, 2025");
        record.set("agency", Some("DOJ".to_string()));
        record.set(COL_SUMMARY, Some("short".to_string()));

        assert_eq!(record.get("agency"), Some("DOJ"));
        assert_eq!(record.get(COL_SUMMARY), Some("short"));
        assert_eq!(record.get(COL_LINK), Some("https://example.gov/eo-1"));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn enrichment_rank_ignores_sentinels_and_blanks() {
        let mut record = Record::default();
        assert_eq!(record.enrichment_rank(), 0);

        record.content = Some(CONTENT_FETCH_FAILED.to_string());
        record.summary = Some("   ".to_string());
        assert_eq!(record.enrichment_rank(), 0);

        record.content = Some(NO_CONTENT.to_string());
        assert_eq!(record.enrichment_rank(), 0);

        record.content = Some("Section 1. Purpose.".to_string());
        record.summary = Some(SUMMARY_FAILED.to_string());
        assert_eq!(record.enrichment_rank(), 1);

        record.summary = Some("A plain-language summary".to_string());
        assert_eq!(record.enrichment_rank(), 2);
    }

    #[test]
    fn ensure_column_keeps_schema_order_and_is_idempotent() {
        let mut store = RecordStore::new(SCRAPER_COLUMNS);
        assert!(store.ensure_column(COL_SUMMARY));
        assert!(!store.ensure_column(COL_TITLE));
        assert_eq!(
            store.columns(),
            &["title", "link", "date", "page_number", "content", "summary"]
        );
    }

    #[test]
    fn parses_listing_and_iso_dates() {
        let expected = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        for raw in [
            "April 8, 2025",
            "Apr 8, 2025",
            "2025-04-08",
            "04/08/2025",
            "8 April 2025",
            "8-Apr-25",
            "2025-04-08T10:00:00-04:00",
            " 2025-04-08 00:00:00 ",
        ] {
            assert_eq!(parse_action_date(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_action_date("No date"), None);
        assert_eq!(parse_action_date(""), None);
    }

    #[test]
    fn standardize_date_leaves_garbage_alone() {
        assert_eq!(standardize_date("January 20, 2025").as_deref(), Some("01/20/2025"));
        assert_eq!(standardize_date("sometime soon"), None);
    }
}
