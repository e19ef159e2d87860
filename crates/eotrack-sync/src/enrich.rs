//! Enrichment driver: walks a work set in order, calling an external enricher per
//! record with retry on overload, pacing between calls and batch pauses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eotrack_adapters::ListingSource;
use eotrack_ai::{SummarizeError, Summarizer};
use eotrack_core::{
    Record, RecordStore, COL_CONTENT, COL_DATE, COL_LINK, COL_SUMMARY, COL_TITLE, CONTENT_FETCH_FAILED,
    NO_CONTENT, NO_LINK, SUMMARY_FAILED,
};
use eotrack_storage::BackoffPolicy;
use serde::Serialize;
use thiserror::Error;

use crate::cancel::{sleep_or_cancel, CancellationToken};
use crate::events::{PipelineEvent, PipelineObserver};
use crate::merge::normalize_identifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichmentFailure {
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("{0}")]
    NonRetryable(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl EnrichmentFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnrichmentFailure::Overloaded(_))
    }
}

#[async_trait]
pub trait Enricher: Send + Sync {
    /// Text the external call works from; `None` or blank means skip the record.
    fn source_text<'r>(&self, record: &'r Record) -> Option<&'r str>;
    fn target_field(&self) -> &str;
    fn failure_sentinel(&self) -> &str;
    /// Fixed value written instead of calling out, for records the call cannot work from.
    fn placeholder(&self, _record: &Record) -> Option<&'static str> {
        None
    }
    async fn enrich(&self, record: &Record) -> Result<String, EnrichmentFailure>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_delay: Duration,
    /// Records per batch; 0 disables batch pauses.
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            request_delay: Duration::from_secs(2),
            batch_size: 5,
            batch_delay: Duration::from_secs(30),
        }
    }
}

impl EnrichmentPolicy {
    /// Detail-page fetching: one second between requests, no batch pauses.
    pub fn scrape_default() -> Self {
        Self {
            request_delay: Duration::from_secs(1),
            batch_size: 0,
            batch_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.attempts() - 1,
            base_delay: self.initial_backoff,
            max_delay: self.max_backoff,
        }
    }

    /// Wait after the record at `index`, and whether it closes a batch.
    fn pause_after(&self, index: usize) -> (Duration, bool) {
        if self.batch_size > 0 && (index + 1) % self.batch_size == 0 {
            (self.batch_delay, true)
        } else {
            (self.request_delay, false)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Records fully handled, in order from the start of the work set.
    pub visited: usize,
    pub calls: usize,
    pub cancelled: bool,
}

enum CallOutcome {
    Success { payload: String, attempts: usize },
    Failed { reason: String, attempts: usize },
    Cancelled { attempts: usize },
}

enum CallState {
    Calling(usize),
    RetryWait { attempt: usize, reason: String },
    Finished(CallOutcome),
}

pub struct EnrichmentDriver {
    policy: EnrichmentPolicy,
    observer: Arc<dyn PipelineObserver>,
}

impl EnrichmentDriver {
    pub fn new(policy: EnrichmentPolicy, observer: Arc<dyn PipelineObserver>) -> Self {
        Self { policy, observer }
    }

    pub fn policy(&self) -> &EnrichmentPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        work: &mut RecordStore,
        enricher: &dyn Enricher,
        id_field: &str,
        token: &CancellationToken,
    ) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        let total = work.len();
        work.ensure_column(enricher.target_field());

        for index in 0..total {
            if token.is_cancelled() {
                self.cancelled(&mut report, total);
                break;
            }

            let record = &work.records()[index];
            let id = normalize_identifier(record.get(id_field));
            let has_source = enricher
                .source_text(record)
                .is_some_and(|text| !text.trim().is_empty());
            if !has_source {
                report.skipped += 1;
                report.visited += 1;
                self.observer
                    .on_event(&PipelineEvent::RecordSkipped { index, id });
                continue;
            }
            if let Some(value) = enricher.placeholder(record) {
                report.skipped += 1;
                report.visited += 1;
                work.records_mut()[index].set(enricher.target_field(), Some(value.to_string()));
                self.observer
                    .on_event(&PipelineEvent::RecordSkipped { index, id });
                continue;
            }

            let outcome = self.call_with_retry(enricher, record, index, &id, token).await;
            let target = enricher.target_field();
            match outcome {
                CallOutcome::Success { payload, attempts } => {
                    report.calls += attempts;
                    report.succeeded += 1;
                    work.records_mut()[index].set(target, Some(payload));
                    self.observer
                        .on_event(&PipelineEvent::RecordEnriched { index, id, attempts });
                }
                CallOutcome::Failed { reason, attempts } => {
                    report.calls += attempts;
                    report.failed += 1;
                    work.records_mut()[index].set(target, Some(enricher.failure_sentinel().to_string()));
                    self.observer.on_event(&PipelineEvent::RecordFailed {
                        index,
                        id,
                        attempts,
                        reason,
                    });
                }
                CallOutcome::Cancelled { attempts } => {
                    report.calls += attempts;
                    self.cancelled(&mut report, total);
                    break;
                }
            }
            report.visited += 1;

            if index + 1 < total {
                let (delay, closes_batch) = self.policy.pause_after(index);
                if closes_batch {
                    self.observer.on_event(&PipelineEvent::BatchPause {
                        after: index + 1,
                        delay,
                    });
                }
                if sleep_or_cancel(token, delay).await {
                    self.cancelled(&mut report, total);
                    break;
                }
            }
        }

        report
    }

    async fn call_with_retry(
        &self,
        enricher: &dyn Enricher,
        record: &Record,
        index: usize,
        id: &str,
        token: &CancellationToken,
    ) -> CallOutcome {
        let max_attempts = self.policy.attempts();
        let backoff = self.policy.backoff();
        let mut state = CallState::Calling(1);
        loop {
            state = match state {
                CallState::Calling(attempt) => match enricher.enrich(record).await {
                    Ok(payload) => CallState::Finished(CallOutcome::Success {
                        payload,
                        attempts: attempt,
                    }),
                    Err(failure) if failure.is_retryable() && attempt < max_attempts => CallState::RetryWait {
                        attempt,
                        reason: failure.to_string(),
                    },
                    Err(failure) => CallState::Finished(CallOutcome::Failed {
                        reason: failure.to_string(),
                        attempts: attempt,
                    }),
                },
                CallState::RetryWait { attempt, reason } => {
                    let delay = backoff.delay_for_attempt(attempt - 1);
                    self.observer.on_event(&PipelineEvent::RetryScheduled {
                        index,
                        id: id.to_string(),
                        attempt,
                        delay,
                        reason,
                    });
                    if sleep_or_cancel(token, delay).await {
                        CallState::Finished(CallOutcome::Cancelled { attempts: attempt })
                    } else {
                        CallState::Calling(attempt + 1)
                    }
                }
                CallState::Finished(outcome) => return outcome,
            };
        }
    }

    fn cancelled(&self, report: &mut EnrichmentReport, total: usize) {
        report.cancelled = true;
        self.observer.on_event(&PipelineEvent::Cancelled {
            visited: report.visited,
            remaining: total - report.visited,
        });
    }
}

/// Fills `content` from the record's detail page.
pub struct DetailContentEnricher<'a> {
    source: &'a dyn ListingSource,
}

impl<'a> DetailContentEnricher<'a> {
    pub fn new(source: &'a dyn ListingSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<'a> Enricher for DetailContentEnricher<'a> {
    fn source_text<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.get(COL_LINK)
    }

    fn target_field(&self) -> &str {
        COL_CONTENT
    }

    fn failure_sentinel(&self) -> &str {
        CONTENT_FETCH_FAILED
    }

    fn placeholder(&self, record: &Record) -> Option<&'static str> {
        let link = record.get(COL_LINK).unwrap_or_default().trim();
        (link == NO_LINK).then_some(NO_CONTENT)
    }

    async fn enrich(&self, record: &Record) -> Result<String, EnrichmentFailure> {
        let link = record.get(COL_LINK).unwrap_or_default().trim();
        self.source.fetch_detail(link).await.map_err(|err| {
            if err.is_retryable() {
                EnrichmentFailure::Overloaded(err.to_string())
            } else {
                EnrichmentFailure::NonRetryable(err.to_string())
            }
        })
    }
}

/// Fills `summary` from the record's content through a [`Summarizer`].
pub struct SummaryEnricher {
    summarizer: Arc<dyn Summarizer>,
    date_field: String,
}

impl SummaryEnricher {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            date_field: COL_DATE.to_string(),
        }
    }

    pub fn with_date_field(mut self, date_field: impl Into<String>) -> Self {
        self.date_field = date_field.into();
        self
    }
}

impl From<SummarizeError> for EnrichmentFailure {
    fn from(err: SummarizeError) -> Self {
        match err {
            SummarizeError::Malformed(message) => EnrichmentFailure::MalformedInput(message),
            other if other.is_retryable() => EnrichmentFailure::Overloaded(other.to_string()),
            other => EnrichmentFailure::NonRetryable(other.to_string()),
        }
    }
}

#[async_trait]
impl Enricher for SummaryEnricher {
    fn source_text<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.get(COL_CONTENT)
    }

    fn target_field(&self) -> &str {
        COL_SUMMARY
    }

    fn failure_sentinel(&self) -> &str {
        SUMMARY_FAILED
    }

    async fn enrich(&self, record: &Record) -> Result<String, EnrichmentFailure> {
        let content = record.get(COL_CONTENT).unwrap_or_default();
        let title = record.get(COL_TITLE).unwrap_or_default();
        let date = record.get(&self.date_field).unwrap_or_default();
        Ok(self.summarizer.summarize(content, title, date).await?)
    }
}
