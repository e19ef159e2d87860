use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use eotrack_adapters::WhiteHouseAdapter;
use eotrack_ai::ClaudeSummarizer;
use eotrack_core::{COL_DATE, COL_LINK, SCRAPER_COLUMNS};
use eotrack_storage::CsvStoreFile;
use eotrack_sync::{
    run_quality_checks, CancellationToken, ObserverSet, PipelineConfig, PipelineObserver, RecordingObserver,
    ScrapePipeline, SummarizeOptions, SummarizePipeline, TracingObserver,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "eotrack")]
#[command(about = "Track presidential actions: scrape, summarize and check the dataset")]
struct Cli {
    /// YAML file overriding pacing, retry and quality settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print the run summary and its pipeline events as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape listing pages and fetch content for new actions.
    Scrape(ScrapeArgs),
    /// Summarize actions that have not been summarized before.
    Summarize(SummarizeArgs),
    /// Run data quality checks over the scraped file.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[arg(long)]
    data_file: Option<PathBuf>,
    /// Number of listing pages to scrape; detected when omitted.
    #[arg(long)]
    pages: Option<usize>,
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Debug, Args)]
struct SummarizeArgs {
    #[arg(long)]
    input: PathBuf,
    /// Previously summarized file to reuse.
    #[arg(long)]
    previous: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, default_value = COL_LINK)]
    unique_id: String,
    #[arg(long, default_value = COL_DATE)]
    date_column: String,
    /// Summarize every input record, even ones already in the previous file.
    #[arg(long)]
    force_update: bool,
    /// Falls back to ANTHROPIC_API_KEY.
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    no_standardize_dates: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long)]
    file: Option<PathBuf>,
    /// Exit non-zero when the quality score is below the pass threshold.
    #[arg(long)]
    fail_on_errors: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eotrack=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    let token = cancel_on_ctrl_c();
    let recorder = Arc::new(RecordingObserver::new());
    let observer: Arc<dyn PipelineObserver> = if cli.json {
        Arc::new(ObserverSet::new(vec![Arc::new(TracingObserver), recorder.clone()]))
    } else {
        Arc::new(TracingObserver)
    };

    match cli.command {
        Commands::Scrape(args) => {
            let base_url = args.base_url.unwrap_or_else(|| config.base_url.clone());
            let data_file = args.data_file.unwrap_or_else(|| config.data_file.clone());
            let adapter = WhiteHouseAdapter::new(config.http_client_config())
                .context("building HTTP client")?
                .with_base_url(base_url);

            let summary = ScrapePipeline::new(Arc::new(adapter), data_file)
                .with_policy(config.scrape.clone())
                .with_page_delay(config.page_delay)
                .with_max_pages(args.pages)
                .with_observer(observer)
                .run(&token)
                .await?;

            if cli.json {
                print_json(run_report(&summary, &recorder)?)?;
            } else {
                println!(
                    "scrape complete: run_id={} pages={} new={} fetched={} failed={} total={} file={}",
                    summary.run_id,
                    summary.pages_scraped,
                    summary.new_records,
                    summary.enrichment.succeeded,
                    summary.enrichment.failed,
                    summary.total_records,
                    summary.data_file
                );
            }
        }
        Commands::Summarize(args) => {
            let model = args.model.unwrap_or_else(|| config.model.clone());
            let summarizer = match args.api_key {
                Some(key) => ClaudeSummarizer::from_key(Some(key), model),
                None => ClaudeSummarizer::from_env(model),
            }
            .context("no API key: pass --api-key or set ANTHROPIC_API_KEY")?;
            let summarizer = Arc::new(summarizer);

            let mut options = SummarizeOptions::new(args.input);
            options.previous = args.previous;
            options.output_dir = args.output_dir.unwrap_or_else(|| config.output_dir.clone());
            options.unique_id = args.unique_id;
            options.date_column = args.date_column;
            options.force = args.force_update;
            options.standardize_dates = !args.no_standardize_dates;

            let summary = SummarizePipeline::new(summarizer, options)
                .with_policy(config.summarize.clone())
                .with_observer(observer)
                .run(&token)
                .await?;

            if cli.json {
                print_json(run_report(&summary, &recorder)?)?;
            } else {
                println!(
                    "summarize complete: run_id={} new={} reused={} failed={} total={} file={}",
                    summary.run_id,
                    summary.newly_summarized,
                    summary.from_previous,
                    summary.enrichment.failed,
                    summary.total_records,
                    summary.output_file
                );
            }
        }
        Commands::Check(args) => {
            let file = args.file.unwrap_or_else(|| config.data_file.clone());
            let store = CsvStoreFile::new(&file).load(&SCRAPER_COLUMNS).await.into_store();
            let report = run_quality_checks(&store, &config.quality, chrono::Local::now().date_naive())?;

            if cli.json {
                print_json(serde_json::to_value(&report)?)?;
            } else {
                for check in &report.checks {
                    println!(
                        "{:<16} {}  {}",
                        check.name,
                        if check.passed { "PASS" } else { "FAIL" },
                        check.notes.join("; ")
                    );
                }
                println!("score {:.1}% ({})", report.score, file.display());
            }

            if args.fail_on_errors && !report.acceptable {
                warn!(score = report.score, "data quality below threshold");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; saving completed work");
            trigger.cancel();
        }
    });
    token
}

fn run_report<T: Serialize>(summary: &T, recorder: &RecordingObserver) -> Result<Value> {
    Ok(json!({
        "summary": serde_json::to_value(summary)?,
        "events": serde_json::to_value(recorder.events())?,
    }))
}

fn print_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
