//! Scrape and summarize runs: load, plan, enrich, merge, persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use eotrack_adapters::ListingSource;
use eotrack_ai::Summarizer;
use eotrack_core::{
    standardize_date, RecordStore, COL_CONTENT, COL_DATE, COL_LINK, COL_SUMMARY, COL_TITLE, SCRAPER_COLUMNS,
    SUMMARIZER_REQUIRED_COLUMNS,
};
use eotrack_storage::CsvStoreFile;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::{sleep_or_cancel, CancellationToken};
use crate::enrich::{DetailContentEnricher, EnrichmentDriver, EnrichmentPolicy, EnrichmentReport, SummaryEnricher};
use crate::events::{PipelineEvent, PipelineObserver, TracingObserver};
use crate::merge::{combine, missing_after_merge, plan_work_set, WorkPlan};
use crate::SyncError;

const MISSING_SAMPLE: usize = 3;

async fn load_store(
    file: &CsvStoreFile,
    default_columns: &[&str],
    observer: &dyn PipelineObserver,
) -> RecordStore {
    let outcome = file.load(default_columns).await;
    observer.on_event(&PipelineEvent::StoreLoaded {
        path: file.path().display().to_string(),
        kind: (&outcome).into(),
        records: outcome.store().len(),
        reason: outcome.corrupt_reason().map(str::to_string),
    });
    outcome.into_store()
}

fn report_plan(plan: &WorkPlan, observer: &dyn PipelineObserver) {
    observer.on_event(&PipelineEvent::WorkPlanned {
        candidate_ids: plan.candidate_ids,
        previous_ids: plan.previous_ids,
        new_ids: plan.new_ids.len(),
        work: plan.work.len(),
        forced: plan.forced,
    });
    if let Some(mismatch) = &plan.mismatch {
        observer.on_event(&PipelineEvent::MergeMismatch(mismatch.clone()));
    }
}

async fn persist_store(
    file: &CsvStoreFile,
    store: &RecordStore,
    observer: &dyn PipelineObserver,
) -> Result<(), SyncError> {
    file.persist(store).await?;
    observer.on_event(&PipelineEvent::Persisted {
        path: file.path().display().to_string(),
        records: store.len(),
    });
    Ok(())
}

// =============================================================================
// Scrape
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub data_file: String,
    pub pages_scraped: usize,
    pub listed: usize,
    pub previous_records: usize,
    pub new_records: usize,
    pub enrichment: EnrichmentReport,
    pub total_records: usize,
    pub persisted: bool,
}

pub struct ScrapePipeline {
    source: Arc<dyn ListingSource>,
    store_file: CsvStoreFile,
    policy: EnrichmentPolicy,
    page_delay: Duration,
    max_pages: Option<usize>,
    observer: Arc<dyn PipelineObserver>,
}

impl ScrapePipeline {
    pub fn new(source: Arc<dyn ListingSource>, data_file: impl Into<PathBuf>) -> Self {
        Self {
            source,
            store_file: CsvStoreFile::new(data_file),
            policy: EnrichmentPolicy::scrape_default(),
            page_delay: Duration::from_secs(2),
            max_pages: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_policy(mut self, policy: EnrichmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Fixes the page count instead of detecting it from the first listing page.
    pub fn with_max_pages(mut self, pages: Option<usize>) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn run(&self, token: &CancellationToken) -> Result<ScrapeRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape", %run_id, source = self.source.source_id());
        self.run_inner(run_id, token).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, token: &CancellationToken) -> Result<ScrapeRunSummary, SyncError> {
        let started_at = Utc::now();
        let observer = self.observer.as_ref();
        let previous = load_store(&self.store_file, &SCRAPER_COLUMNS, observer).await;

        let total_pages = match self.max_pages {
            Some(pages) => pages,
            None => self.source.detect_total_pages().await,
        }
        .max(1);
        info!(total_pages, "scraping listing pages");

        let mut candidate = RecordStore::new(SCRAPER_COLUMNS);
        let mut pages_scraped = 0usize;
        for page in 1..=total_pages {
            if token.is_cancelled() {
                break;
            }
            match self.source.fetch_listing(page).await {
                Ok(items) if items.is_empty() => {
                    info!(page, "no items on page; stopping");
                    break;
                }
                Ok(items) => {
                    info!(page, items = items.len(), "listing page scraped");
                    pages_scraped += 1;
                    for item in items {
                        candidate.push(item);
                    }
                }
                Err(err) => {
                    warn!(page, error = %err, "listing page failed; stopping");
                    break;
                }
            }
            if page < total_pages && sleep_or_cancel(token, self.page_delay).await {
                break;
            }
        }
        let listed = candidate.len();

        let plan = plan_work_set(&previous, &candidate, COL_LINK, false);
        report_plan(&plan, observer);
        let mut work = plan.work;
        let new_records = work.len();

        let driver = EnrichmentDriver::new(self.policy.clone(), self.observer.clone());
        let enricher = DetailContentEnricher::new(self.source.as_ref());
        let enrichment = driver.run(&mut work, &enricher, COL_LINK, token).await;
        if enrichment.cancelled {
            work.truncate(enrichment.visited);
        }

        let previous_records = previous.len();
        let work_len = work.len();
        let merged = combine(Some(previous), work, COL_LINK, COL_DATE);
        observer.on_event(&PipelineEvent::Merged {
            previous: previous_records,
            work: work_len,
            result: merged.len(),
        });

        let persisted = if merged.is_empty() {
            info!("nothing scraped and no existing records; leaving data file untouched");
            false
        } else {
            persist_store(&self.store_file, &merged, observer).await?;
            true
        };

        Ok(ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            data_file: self.store_file.path().display().to_string(),
            pages_scraped,
            listed,
            previous_records,
            new_records,
            enrichment,
            total_records: merged.len(),
            persisted,
        })
    }
}

// =============================================================================
// Summarize
// =============================================================================

#[derive(Debug, Clone)]
pub struct SummarizeOptions {
    pub input: PathBuf,
    pub previous: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub unique_id: String,
    pub date_column: String,
    pub force: bool,
    pub standardize_dates: bool,
    pub run_date: NaiveDate,
}

impl SummarizeOptions {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            previous: None,
            output_dir: PathBuf::from("output"),
            unique_id: COL_LINK.to_string(),
            date_column: COL_DATE.to_string(),
            force: false,
            standardize_dates: true,
            run_date: Local::now().date_naive(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "executive_orders_summarized_{}.csv",
            self.run_date.format("%Y-%m-%d")
        ))
    }

    fn required_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = SUMMARIZER_REQUIRED_COLUMNS.to_vec();
        if !columns.contains(&self.unique_id.as_str()) {
            columns.push(&self.unique_id);
        }
        columns
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummarizeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_file: String,
    pub candidates: usize,
    pub newly_summarized: usize,
    pub from_previous: usize,
    pub enrichment: EnrichmentReport,
    pub total_records: usize,
    pub missing_from_result: usize,
}

pub struct SummarizePipeline {
    summarizer: Arc<dyn Summarizer>,
    options: SummarizeOptions,
    policy: EnrichmentPolicy,
    observer: Arc<dyn PipelineObserver>,
}

impl SummarizePipeline {
    pub fn new(summarizer: Arc<dyn Summarizer>, options: SummarizeOptions) -> Self {
        Self {
            summarizer,
            options,
            policy: EnrichmentPolicy::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_policy(mut self, policy: EnrichmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &SummarizeOptions {
        &self.options
    }

    pub async fn run(&self, token: &CancellationToken) -> Result<SummarizeRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("summarize", %run_id, input = %self.options.input.display());
        self.run_inner(run_id, token).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, token: &CancellationToken) -> Result<SummarizeRunSummary, SyncError> {
        let started_at = Utc::now();
        let observer = self.observer.as_ref();
        let opts = &self.options;
        let id_field = opts.unique_id.as_str();
        let date_field = opts.date_column.as_str();

        let mut input_columns = vec![COL_TITLE, COL_LINK, COL_DATE, COL_CONTENT];
        if !input_columns.contains(&id_field) {
            input_columns.push(id_field);
        }
        let mut candidate = load_store(&CsvStoreFile::new(&opts.input), &input_columns, observer).await;
        check_schema(&opts.input, &candidate, &opts.required_columns())?;
        if opts.standardize_dates {
            standardize_dates(&mut candidate, date_field);
        }

        let previous = match &opts.previous {
            Some(path) => {
                let mut defaults: Vec<&str> = candidate.columns().iter().map(String::as_str).collect();
                if !defaults.contains(&COL_SUMMARY) {
                    defaults.push(COL_SUMMARY);
                }
                let mut previous = load_store(&CsvStoreFile::new(path), &defaults, observer).await;
                if !previous.is_empty() && !previous.has_column(COL_SUMMARY) {
                    warn!(path = %path.display(), "previous file has no summary column");
                }
                if opts.standardize_dates {
                    standardize_dates(&mut previous, date_field);
                }
                Some(previous)
            }
            None => None,
        };

        let empty = RecordStore::new(candidate.columns().iter().cloned());
        let plan = plan_work_set(previous.as_ref().unwrap_or(&empty), &candidate, id_field, opts.force);
        report_plan(&plan, observer);
        let mut work = plan.work;
        work.fill_column(COL_SUMMARY, None);

        let driver = EnrichmentDriver::new(self.policy.clone(), self.observer.clone());
        let enricher = SummaryEnricher::new(self.summarizer.clone()).with_date_field(date_field);
        let enrichment = driver.run(&mut work, &enricher, id_field, token).await;
        if enrichment.cancelled {
            work.truncate(enrichment.visited);
        }

        let previous_records = previous.as_ref().map(RecordStore::len).unwrap_or(0);
        let newly_summarized = work.len();
        let merged = combine(previous, work, id_field, date_field);
        observer.on_event(&PipelineEvent::Merged {
            previous: previous_records,
            work: newly_summarized,
            result: merged.len(),
        });

        let missing = missing_after_merge(&candidate, &merged, id_field);
        if !missing.is_empty() && !enrichment.cancelled {
            observer.on_event(&PipelineEvent::CandidatesMissing {
                missing: missing.len(),
                sample: missing.iter().take(MISSING_SAMPLE).cloned().collect(),
            });
        }

        let output = CsvStoreFile::new(opts.output_path());
        persist_store(&output, &merged, observer).await?;

        Ok(SummarizeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            output_file: output.path().display().to_string(),
            candidates: candidate.len(),
            newly_summarized,
            from_previous: merged.len().saturating_sub(newly_summarized),
            enrichment,
            total_records: merged.len(),
            missing_from_result: missing.len(),
        })
    }
}

fn check_schema(path: &Path, store: &RecordStore, required: &[&str]) -> Result<(), SyncError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|c| !store.has_column(c))
        .map(|c| c.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Schema {
            path: path.to_path_buf(),
            missing,
        })
    }
}

/// Rewrites parsable dates as `MM/DD/YYYY`; unparsable values are left as they are.
fn standardize_dates(store: &mut RecordStore, date_field: &str) {
    if !store.has_column(date_field) {
        return;
    }
    for record in store.records_mut() {
        if let Some(formatted) = record.get(date_field).and_then(standardize_date) {
            record.set(date_field, Some(formatted));
        }
    }
}
