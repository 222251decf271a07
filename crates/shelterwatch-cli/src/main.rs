use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shelterwatch_adapters::{classify, CountOracle};
use shelterwatch_core::{CaptureHints, RawCapture};
use shelterwatch_storage::{ApplyOptions, YamlHistoryStore};
use shelterwatch_sync::{
    maybe_build_scheduler, pipeline_from_env, BatchReport, Pipeline, PipelineConfig, RunMode,
    SourceRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelterwatch")]
#[command(about = "Shelter listing pipeline: capture, extract, load and run health")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture, extract and load every enabled source, or just one.
    Run {
        #[arg(long)]
        source: Option<String>,
    },
    /// Capture (and extract, where an adapter exists) without loading.
    Capture {
        #[arg(long)]
        source: Option<String>,
    },
    /// Load the item sets already on disk.
    Load {
        #[arg(long)]
        source: Option<String>,
        /// Also load drafts flagged for review.
        #[arg(long)]
        skip_review: bool,
    },
    /// Print the per-source health summary as markdown.
    Summary,
    /// Set the label shown for a source in the summary, or clear it when no name is given.
    Label { source: String, name: Option<String> },
    /// Estimate item count and script-rendering signals for a saved capture.
    Inspect {
        file: PathBuf,
        #[arg(long = "selector")]
        selectors: Vec<String>,
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
    /// Run the full pipeline on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { source: None }) {
        Commands::Run { source } => {
            let pipeline = pipeline_from_env().await?;
            run(&pipeline, source, RunMode::Full, ApplyOptions::default()).await?;
        }
        Commands::Capture { source } => {
            let pipeline = pipeline_from_env().await?;
            run(&pipeline, source, RunMode::CaptureOnly, ApplyOptions::default()).await?;
        }
        Commands::Load {
            source,
            skip_review,
        } => {
            let pipeline = pipeline_from_env().await?;
            run(&pipeline, source, RunMode::LoadOnly, ApplyOptions { skip_review }).await?;
        }
        Commands::Summary => {
            let pipeline = pipeline_from_env().await?;
            let summary = pipeline.summary().await?;
            print!("{}", summary.render_markdown());
        }
        Commands::Label { source, name } => {
            let config = PipelineConfig::from_env();
            SourceRegistry::load(config.sources_file())?.get(&source)?;
            let history = YamlHistoryStore::new(config.history_file)
                .set_display_name(&source, name)
                .await?;
            let label = history.display_name.as_deref().unwrap_or("(no label)");
            println!("{source}: {label}");
        }
        Commands::Inspect {
            file,
            selectors,
            keywords,
        } => inspect(file, selectors, keywords)?,
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let Some(sched) = maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
                bail!("scheduler disabled; set SHELTERWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().capture_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}

async fn run(
    pipeline: &Pipeline,
    source: Option<String>,
    mode: RunMode,
    options: ApplyOptions,
) -> Result<()> {
    let batch = match source {
        Some(source_id) => BatchReport {
            runs: vec![pipeline.run_source(&source_id, mode, options).await?],
            failures: Vec::new(),
        },
        None => pipeline.run_all(mode, options).await,
    };

    println!("{}", serde_json::to_string_pretty(&batch)?);
    if !batch.failures.is_empty() {
        bail!("{} source(s) failed", batch.failures.len());
    }
    Ok(())
}

fn inspect(file: PathBuf, selectors: Vec<String>, keywords: Vec<String>) -> Result<()> {
    let body = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let capture = RawCapture::new("inspect", file.display().to_string(), body, Utc::now());
    let hints = CaptureHints {
        expected_selectors: selectors,
        heading_keywords: keywords,
    };

    let estimate = CountOracle::default().estimate_detailed(&capture, &hints);
    let detection = classify(&capture, &hints);
    let report = serde_json::json!({
        "file": file.display().to_string(),
        "byte_size": capture.byte_size(),
        "expected_count": estimate.count,
        "estimator": estimate.estimator,
        "requires_dynamic_rendering": detection.requires_dynamic_rendering,
        "score": detection.score,
        "max_score": detection.max_score,
        "signals": detection.active_signals(),
        "recommendation": detection.recommendation(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
