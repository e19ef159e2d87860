//! Progress events emitted by the merge engine, the enrichment driver and the pipelines.

use std::sync::Mutex;
use std::time::Duration;

use eotrack_storage::LoadOutcome;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::merge::MergeMismatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    Loaded,
    Missing,
    Corrupt,
}

impl From<&LoadOutcome> for LoadKind {
    fn from(outcome: &LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Loaded(_) => LoadKind::Loaded,
            LoadOutcome::Missing(_) => LoadKind::Missing,
            LoadOutcome::Corrupt { .. } => LoadKind::Corrupt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StoreLoaded {
        path: String,
        kind: LoadKind,
        records: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    WorkPlanned {
        candidate_ids: usize,
        previous_ids: usize,
        new_ids: usize,
        work: usize,
        forced: bool,
    },
    MergeMismatch(MergeMismatch),
    RecordSkipped {
        index: usize,
        id: String,
    },
    RetryScheduled {
        index: usize,
        id: String,
        attempt: usize,
        delay: Duration,
        reason: String,
    },
    RecordEnriched {
        index: usize,
        id: String,
        attempts: usize,
    },
    RecordFailed {
        index: usize,
        id: String,
        attempts: usize,
        reason: String,
    },
    BatchPause {
        after: usize,
        delay: Duration,
    },
    Cancelled {
        visited: usize,
        remaining: usize,
    },
    CandidatesMissing {
        missing: usize,
        sample: Vec<String>,
    },
    Merged {
        previous: usize,
        work: usize,
        result: usize,
    },
    Persisted {
        path: String,
        records: usize,
    },
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Default observer: one log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StoreLoaded {
                path,
                kind,
                records,
                reason,
            } => match kind {
                LoadKind::Loaded => info!(%path, records, "loaded record store"),
                LoadKind::Missing => info!(%path, "record store not found; starting empty"),
                LoadKind::Corrupt => warn!(
                    %path,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "record store unreadable; starting empty"
                ),
            },
            PipelineEvent::WorkPlanned {
                candidate_ids,
                previous_ids,
                new_ids,
                work,
                forced,
            } => info!(
                candidate_ids,
                previous_ids,
                new_ids,
                work,
                forced,
                "planned work set"
            ),
            PipelineEvent::MergeMismatch(mismatch) => warn!(
                new_ids = mismatch.new_ids,
                matched = mismatch.matched,
                sample = ?mismatch.sample,
                "new identifiers detected but no records matched them"
            ),
            PipelineEvent::RecordSkipped { index, id } => {
                debug!(index, %id, "no source text; skipping record")
            }
            PipelineEvent::RetryScheduled {
                index,
                id,
                attempt,
                delay,
                reason,
            } => warn!(
                index,
                %id,
                attempt,
                delay_secs = delay.as_secs_f64(),
                %reason,
                "provider overloaded; retrying"
            ),
            PipelineEvent::RecordEnriched { index, id, attempts } => {
                info!(index, %id, attempts, "record enriched")
            }
            PipelineEvent::RecordFailed {
                index,
                id,
                attempts,
                reason,
            } => warn!(index, %id, attempts, %reason, "enrichment failed; wrote sentinel"),
            PipelineEvent::BatchPause { after, delay } => {
                info!(after, delay_secs = delay.as_secs_f64(), "batch complete; pausing")
            }
            PipelineEvent::Cancelled { visited, remaining } => {
                warn!(visited, remaining, "cancelled; keeping completed work")
            }
            PipelineEvent::CandidatesMissing { missing, sample } => warn!(
                missing,
                sample = ?sample,
                "candidate records absent from merged result"
            ),
            PipelineEvent::Merged {
                previous,
                work,
                result,
            } => info!(previous, work, result, "merged record store"),
            PipelineEvent::Persisted { path, records } => {
                info!(%path, records, "persisted record store")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Fans one event out to several observers.
pub struct ObserverSet {
    observers: Vec<std::sync::Arc<dyn PipelineObserver>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<std::sync::Arc<dyn PipelineObserver>>) -> Self {
        Self { observers }
    }
}

impl PipelineObserver for ObserverSet {
    fn on_event(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
