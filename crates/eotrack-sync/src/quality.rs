//! Data quality checks over a scraped record store.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use eotrack_core::{parse_action_date, RecordStore, COL_CONTENT, COL_DATE, COL_LINK, COL_TITLE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SyncError;

static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static WHITESPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{3,}").expect("valid whitespace regex"));

const CRITICAL_COLUMNS: [&str; 4] = [COL_TITLE, COL_LINK, COL_DATE, COL_CONTENT];
const ERROR_CONTENT_MARKERS: [&str; 2] = ["error fetching content", "no content found"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub max_missing_pct: f64,
    pub max_format_error_pct: f64,
    pub max_content_issue_pct: f64,
    pub stale_warning_days: i64,
    pub fresh_days: i64,
    pub pass_score: f64,
    pub short_content_chars: usize,
    pub very_short_content_chars: usize,
    pub link_pattern: String,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_missing_pct: 10.0,
            max_format_error_pct: 10.0,
            max_content_issue_pct: 15.0,
            stale_warning_days: 14,
            fresh_days: 30,
            pass_score: 80.0,
            short_content_chars: 100,
            very_short_content_chars: 200,
            link_pattern: r"^https?://www\.whitehouse\.gov/.*$".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub notes: Vec<String>,
}

impl CheckOutcome {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            notes: Vec::new(),
        }
    }

    fn fail(mut self, note: impl Into<String>) -> Self {
        self.passed = false;
        self.notes.push(note.into());
        self
    }

    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub records: usize,
    pub checks: Vec<CheckOutcome>,
    pub score: f64,
    pub acceptable: bool,
}

impl QualityReport {
    fn unacceptable(reason: &str) -> Self {
        Self {
            records: 0,
            checks: vec![CheckOutcome::new("load").fail(reason)],
            score: 0.0,
            acceptable: false,
        }
    }
}

fn pct(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

pub fn run_quality_checks(
    store: &RecordStore,
    thresholds: &QualityThresholds,
    today: NaiveDate,
) -> Result<QualityReport, SyncError> {
    if store.is_empty() {
        warn!("no records to check");
        return Ok(QualityReport::unacceptable("record store is empty or missing"));
    }
    let link_re = Regex::new(&thresholds.link_pattern)
        .map_err(|err| SyncError::Config(format!("invalid link pattern: {err}")))?;

    let checks = vec![
        check_missing_values(store, thresholds),
        check_formats(store, thresholds, &link_re),
        check_duplicates(store),
        check_content_quality(store, thresholds),
        check_recency(store, thresholds, today),
    ];
    let passed = checks.iter().filter(|c| c.passed).count();
    let score = pct(passed, checks.len());
    let acceptable = score >= thresholds.pass_score;

    for check in &checks {
        if check.passed {
            info!(check = check.name, notes = ?check.notes, "quality check passed");
        } else {
            warn!(check = check.name, notes = ?check.notes, "quality check failed");
        }
    }
    info!(records = store.len(), score, acceptable, "quality checks complete");

    Ok(QualityReport {
        records: store.len(),
        checks,
        score,
        acceptable,
    })
}

fn check_missing_values(store: &RecordStore, thresholds: &QualityThresholds) -> CheckOutcome {
    let mut outcome = CheckOutcome::new("missing_values");
    let absent: Vec<&str> = CRITICAL_COLUMNS
        .into_iter()
        .filter(|c| !store.has_column(c))
        .collect();
    if !absent.is_empty() {
        return outcome.fail(format!("missing critical columns: {}", absent.join(", ")));
    }

    let total = store.len();
    for column in CRITICAL_COLUMNS {
        let missing = store
            .records()
            .iter()
            .filter(|r| r.get(column).is_none_or(|v| v.trim().is_empty()))
            .count();
        let share = pct(missing, total);
        if share > thresholds.max_missing_pct {
            outcome.note(format!("{column}: {missing} missing ({share:.1}%)"));
        }
    }

    let all_missing = store
        .records()
        .iter()
        .filter(|r| CRITICAL_COLUMNS.iter().all(|c| r.get(c).is_none_or(|v| v.trim().is_empty())))
        .count();
    if all_missing > 0 {
        return outcome.fail(format!("{all_missing} records missing every critical field"));
    }
    outcome
}

fn check_formats(store: &RecordStore, thresholds: &QualityThresholds, link_re: &Regex) -> CheckOutcome {
    let mut outcome = CheckOutcome::new("data_formats");
    let records = store.records();

    let invalid_urls = records
        .iter()
        .filter(|r| !r.get(COL_LINK).is_some_and(|l| link_re.is_match(l)))
        .count();
    let invalid_dates = records
        .iter()
        .filter(|r| r.get(COL_DATE).and_then(parse_action_date).is_none())
        .count();
    let short_content = records
        .iter()
        .filter(|r| {
            r.get(COL_CONTENT)
                .is_some_and(|c| c.chars().count() < thresholds.short_content_chars)
        })
        .count();
    let error_content = records
        .iter()
        .filter(|r| {
            r.get(COL_CONTENT).is_some_and(|c| {
                let lower = c.to_lowercase();
                ERROR_CONTENT_MARKERS.iter().any(|m| lower.contains(*m))
            })
        })
        .count();

    for (label, count) in [
        ("invalid urls", invalid_urls),
        ("invalid dates", invalid_dates),
        ("short content", short_content),
        ("error content", error_content),
    ] {
        if count > 0 {
            outcome.note(format!("{label}: {count}"));
        }
    }

    let format_errors = invalid_urls + invalid_dates + error_content;
    let share = pct(format_errors, records.len());
    if share > thresholds.max_format_error_pct {
        return outcome.fail(format!("format errors {share:.1}% exceed threshold"));
    }
    outcome
}

fn check_duplicates(store: &RecordStore) -> CheckOutcome {
    let mut outcome = CheckOutcome::new("duplicates");

    let mut seen_rows = HashSet::new();
    let exact = (0..store.len())
        .filter_map(|i| store.row(i))
        .filter(|row| !seen_rows.insert(row.clone()))
        .count();

    let mut seen_links = HashSet::new();
    let links = store
        .records()
        .iter()
        .filter_map(|r| r.get(COL_LINK))
        .filter(|l| !seen_links.insert(*l))
        .count();

    let mut links_by_title: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for record in store.records() {
        if let (Some(title), Some(link)) = (record.get(COL_TITLE), record.get(COL_LINK)) {
            links_by_title.entry(title).or_default().insert(link);
        }
    }
    let shared_titles = links_by_title.values().filter(|l| l.len() > 1).count();
    if shared_titles > 0 {
        outcome.note(format!("{shared_titles} titles appear with several links"));
    }

    if exact > 0 || links > 0 {
        return outcome.fail(format!("{exact} exact duplicate rows, {links} duplicate links"));
    }
    outcome
}

fn check_content_quality(store: &RecordStore, thresholds: &QualityThresholds) -> CheckOutcome {
    let mut outcome = CheckOutcome::new("content_quality");
    if !store.has_column(COL_CONTENT) {
        return outcome.fail("content column missing");
    }

    let contents: Vec<&str> = store.records().iter().filter_map(|r| r.get(COL_CONTENT)).collect();
    if let (Some(min), Some(max)) = (
        contents.iter().map(|c| c.chars().count()).min(),
        contents.iter().map(|c| c.chars().count()).max(),
    ) {
        let avg = contents.iter().map(|c| c.chars().count()).sum::<usize>() as f64 / contents.len() as f64;
        outcome.note(format!("length avg {avg:.0}, min {min}, max {max}"));
    }

    let very_short = contents
        .iter()
        .filter(|c| c.chars().count() < thresholds.very_short_content_chars)
        .count();
    let html = contents.iter().filter(|c| HTML_TAG_RE.is_match(c)).count();
    let whitespace = contents.iter().filter(|c| WHITESPACE_RUN_RE.is_match(c)).count();
    if whitespace > 0 {
        outcome.note(format!("{whitespace} records with runs of whitespace"));
    }

    let share = pct(very_short + html, store.len());
    if share > thresholds.max_content_issue_pct {
        return outcome.fail(format!(
            "{very_short} very short and {html} html-bearing records ({share:.1}%)"
        ));
    }
    outcome
}

fn check_recency(store: &RecordStore, thresholds: &QualityThresholds, today: NaiveDate) -> CheckOutcome {
    let mut outcome = CheckOutcome::new("recency");
    let Some(most_recent) = store
        .records()
        .iter()
        .filter_map(|r| r.get(COL_DATE).and_then(parse_action_date))
        .max()
    else {
        return outcome.fail("no parsable dates");
    };

    let age = (today - most_recent).num_days();
    outcome.note(format!("most recent action {most_recent} ({age} days old)"));
    if age > thresholds.stale_warning_days {
        outcome.note("no new actions in over two weeks");
    }
    if age > thresholds.fresh_days {
        return outcome.fail(format!("most recent action older than {} days", thresholds.fresh_days));
    }
    outcome
}
