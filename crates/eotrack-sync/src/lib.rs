//! Incremental scrape and summarize pipelines over a CSV record store.

pub mod cancel;
pub mod enrich;
pub mod events;
pub mod merge;
pub mod pipeline;
pub mod quality;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use eotrack_adapters::WHITEHOUSE_ACTIONS_URL;
use eotrack_ai::DEFAULT_MODEL;
use eotrack_storage::{HttpClientConfig, StorageError, DEFAULT_USER_AGENT};
use serde::Deserialize;
use thiserror::Error;

pub use cancel::CancellationToken;
pub use enrich::{
    DetailContentEnricher, EnrichmentDriver, EnrichmentFailure, EnrichmentPolicy, EnrichmentReport, Enricher,
    SummaryEnricher,
};
pub use events::{ObserverSet, PipelineEvent, PipelineObserver, RecordingObserver, TracingObserver};
pub use merge::{combine, missing_after_merge, plan_work_set, MergeMismatch, WorkPlan};
pub use pipeline::{ScrapePipeline, ScrapeRunSummary, SummarizeOptions, SummarizePipeline, SummarizeRunSummary};
pub use quality::{run_quality_checks, QualityReport, QualityThresholds};

pub const CRATE_NAME: &str = "eotrack-sync";

pub const DEFAULT_DATA_FILE: &str = "data/presidential_actions_with_content.csv";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{} is missing required columns: {}", path.display(), missing.join(", "))]
    Schema { path: PathBuf, missing: Vec<String> },
    #[error(transparent)]
    Persist(#[from] StorageError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_file: PathBuf,
    pub output_dir: PathBuf,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub model: String,
    pub page_delay: Duration,
    pub scrape: EnrichmentPolicy,
    pub summarize: EnrichmentPolicy,
    pub quality: QualityThresholds,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_file: std::env::var("EOTRACK_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_FILE)),
            output_dir: std::env::var("EOTRACK_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("output")),
            base_url: std::env::var("EOTRACK_BASE_URL").unwrap_or_else(|_| WHITEHOUSE_ACTIONS_URL.to_string()),
            user_agent: std::env::var("EOTRACK_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("EOTRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            model: std::env::var("EOTRACK_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            page_delay: Duration::from_secs(2),
            scrape: EnrichmentPolicy::scrape_default(),
            summarize: EnrichmentPolicy::default(),
            quality: QualityThresholds::default(),
        }
    }

    /// Environment defaults with the YAML file at `path` layered on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let overrides: ConfigFile =
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            config.apply(overrides);
        }
        Ok(config)
    }

    pub fn apply(&mut self, file: ConfigFile) {
        if let Some(v) = file.data_file {
            self.data_file = v;
        }
        if let Some(v) = file.output_dir {
            self.output_dir = v;
        }
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.page_delay_secs {
            self.page_delay = secs(v);
        }
        if let Some(overrides) = file.scrape {
            overrides.apply_to(&mut self.scrape);
        }
        if let Some(overrides) = file.summarize {
            overrides.apply_to(&mut self.summarize);
        }
        if let Some(quality) = file.quality {
            self.quality = quality;
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub data_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub model: Option<String>,
    pub page_delay_secs: Option<f64>,
    pub scrape: Option<PolicyOverrides>,
    pub summarize: Option<PolicyOverrides>,
    pub quality: Option<QualityThresholds>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverrides {
    pub max_attempts: Option<usize>,
    pub initial_backoff_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
    pub request_delay_secs: Option<f64>,
    pub batch_size: Option<usize>,
    pub batch_delay_secs: Option<f64>,
}

impl PolicyOverrides {
    fn apply_to(self, policy: &mut EnrichmentPolicy) {
        if let Some(v) = self.max_attempts {
            policy.max_attempts = v;
        }
        if let Some(v) = self.initial_backoff_secs {
            policy.initial_backoff = secs(v);
        }
        if let Some(v) = self.max_backoff_secs {
            policy.max_backoff = secs(v);
        }
        if let Some(v) = self.request_delay_secs {
            policy.request_delay = secs(v);
        }
        if let Some(v) = self.batch_size {
            policy.batch_size = v;
        }
        if let Some(v) = self.batch_delay_secs {
            policy.batch_delay = secs(v);
        }
    }
}
