//! Pipeline orchestration: capture, extract and load stages per source, with run tracking.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use shelterwatch_adapters::{
    classify, load_item_sets_in, write_item_set, AdapterRegistry, CountOracle, ItemSetFile,
    ItemSetMeta, RenderDetection,
};
use shelterwatch_core::{ItemDraft, RawCapture, RunEntry, Stage};
use shelterwatch_storage::{
    ApplyOptions, CaptureArchive, FetcherConfig, HistoryStore, HttpFetcher, ReconcileReport,
    StoreReconciler, YamlHistoryStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod registry;
pub mod summary;
pub mod tracker;

pub use config::PipelineConfig;
pub use registry::{ConfigError, SourceConfig, SourceRegistry};
pub use summary::{HistorySummary, SourceStatusLine};
pub use tracker::RunTracker;

pub const CRATE_NAME: &str = "shelterwatch-sync";

/// Which stages one invocation runs for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Capture, extract when an adapter is registered, then load.
    Full,
    /// Capture, and extract when an adapter is registered.
    CaptureOnly,
    /// Load the item sets already on disk, carrying earlier counts forward.
    LoadOnly,
}

impl RunMode {
    fn captures(self) -> bool {
        matches!(self, RunMode::Full | RunMode::CaptureOnly)
    }

    fn loads(self) -> bool {
        matches!(self, RunMode::Full | RunMode::LoadOnly)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub expected_count: usize,
    pub estimator: Option<&'static str>,
    pub archived_path: PathBuf,
    /// Present only when the capture held no recognizable items.
    pub detection: Option<RenderDetection>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub capture: Option<CaptureOutcome>,
    pub item_set_path: Option<PathBuf>,
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub run_id: Uuid,
    pub entry: Option<RunEntry>,
    pub stages: StageReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub runs: Vec<SourceRunReport>,
    pub failures: Vec<SourceFailure>,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: SourceRegistry,
    adapters: AdapterRegistry,
    history: Arc<dyn HistoryStore>,
    store: StoreReconciler,
    archive: CaptureArchive,
    fetcher: HttpFetcher,
    oracle: CountOracle,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: SourceRegistry,
        history: Arc<dyn HistoryStore>,
        store: StoreReconciler,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self {
            archive: CaptureArchive::new(config.captures_dir.clone()),
            config,
            registry,
            adapters: AdapterRegistry::new(),
            history,
            store,
            fetcher,
            oracle: CountOracle::default(),
        })
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StoreReconciler {
        &self.store
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn archive(&self) -> &CaptureArchive {
        &self.archive
    }

    /// Run `mode` for one source, fetching its listing over HTTP when capturing.
    pub async fn run_source(
        &self,
        source_id: &str,
        mode: RunMode,
        options: ApplyOptions,
    ) -> Result<SourceRunReport> {
        self.run_tracked(source_id, mode, options, None).await
    }

    /// Like [`Pipeline::run_source`], but the capture stage ingests `capture` instead of fetching.
    pub async fn run_source_with_capture(
        &self,
        capture: RawCapture,
        mode: RunMode,
        options: ApplyOptions,
    ) -> Result<SourceRunReport> {
        let source_id = capture.source_id.clone();
        self.run_tracked(&source_id, mode, options, Some(capture))
            .await
    }

    /// Run every enabled source; one source failing does not stop the others.
    pub async fn run_all(&self, mode: RunMode, options: ApplyOptions) -> BatchReport {
        let mut batch = BatchReport::default();
        let source_ids = self
            .registry
            .enabled()
            .map(|s| s.source_id.clone())
            .collect::<Vec<_>>();

        for source_id in source_ids {
            match self.run_source(&source_id, mode, options).await {
                Ok(report) => batch.runs.push(report),
                Err(err) => {
                    let error = format!("{err:#}");
                    error!(source_id = %source_id, %error, "source run failed");
                    batch.failures.push(SourceFailure { source_id, error });
                }
            }
        }

        info!(
            succeeded = batch.runs.len(),
            failed = batch.failures.len(),
            "batch finished"
        );
        batch
    }

    async fn run_tracked(
        &self,
        source_id: &str,
        mode: RunMode,
        options: ApplyOptions,
        capture: Option<RawCapture>,
    ) -> Result<SourceRunReport> {
        let source = self.registry.get(source_id)?.clone();
        let mut tracker = RunTracker::new(source_id, Arc::clone(&self.history));
        let span = tracker.span();

        async move {
            tracker.start();
            if !mode.captures() {
                tracker.load_carried_counts().await;
            }

            let result = self
                .run_stages(&mut tracker, &source, mode, options, capture)
                .await;
            if let Err(err) = &result {
                tracker.record_error(format!("{err:#}"));
            }

            let run_id = tracker.run_id();
            let entry = tracker.finalize().await;
            let stages = result?;
            Ok::<_, anyhow::Error>(SourceRunReport {
                source_id: source.source_id.clone(),
                run_id,
                entry,
                stages,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        tracker: &mut RunTracker,
        source: &SourceConfig,
        mode: RunMode,
        options: ApplyOptions,
        capture: Option<RawCapture>,
    ) -> Result<StageReport> {
        let mut report = StageReport::default();

        if mode.captures() {
            let raw = match capture {
                Some(raw) => raw,
                None => self
                    .fetcher
                    .fetch_capture(tracker.run_id(), &source.source_id, &source.base_url)
                    .await
                    .with_context(|| format!("capturing {}", source.base_url))?,
            };
            report.capture = Some(self.ingest_capture(tracker, source, &raw).await?);
            report.item_set_path = self.extract(tracker, &raw)?;
        }

        if mode.loads() {
            report.reconcile = self.load(tracker, &source.source_id, options).await?;
        }

        Ok(report)
    }

    /// Capture stage: estimate the expected count, archive the capture and, when it
    /// holds nothing recognizable, check whether it is a script-rendered shell.
    pub async fn ingest_capture(
        &self,
        tracker: &mut RunTracker,
        source: &SourceConfig,
        raw: &RawCapture,
    ) -> Result<CaptureOutcome> {
        let hints = source.hints();
        let estimate = self.oracle.estimate_detailed(raw, &hints);
        tracker.record_stage_count(Stage::Capture, estimate.count as u64);

        let archived = self
            .archive
            .store(raw, estimate.count)
            .await
            .with_context(|| format!("archiving capture of {}", raw.source_id))?;

        let detection = if estimate.count == 0 {
            let detection = classify(raw, &hints);
            if detection.requires_dynamic_rendering {
                warn!(
                    score = detection.score,
                    signals = ?detection.active_signals(),
                    recommendation = detection.recommendation(),
                    "capture holds no items and looks script-rendered"
                );
                self.archive
                    .store_render_warning(raw, &detection)
                    .await
                    .with_context(|| format!("saving render warning for {}", raw.source_id))?;
            }
            Some(detection)
        } else {
            None
        };

        Ok(CaptureOutcome {
            expected_count: estimate.count,
            estimator: estimate.estimator,
            archived_path: archived.absolute_path,
            detection,
        })
    }

    /// Extract stage, run only when an adapter is registered for the capture's source.
    pub fn extract(&self, tracker: &mut RunTracker, raw: &RawCapture) -> Result<Option<PathBuf>> {
        let Some(adapter) = self.adapters.adapter_for_source(&raw.source_id) else {
            debug!("no in-process adapter; extraction left to external tooling");
            return Ok(None);
        };

        let drafts = adapter
            .extract_checked(raw)
            .with_context(|| format!("extracting {}", raw.source_id))?;
        tracker.record_stage_count(Stage::Extract, drafts.len() as u64);

        let set = ItemSetFile::new(
            ItemSetMeta {
                source_id: raw.source_id.clone(),
                source_url: Some(raw.url.clone()),
                extracted_at: Utc::now(),
                extractor_version: adapter.extractor_version().to_string(),
            },
            drafts,
        );
        let path = write_item_set(self.config.items_dir_for(&raw.source_id), &set)?;
        Ok(Some(path))
    }

    /// Load stage: reconcile every item set on disk for the source against the store.
    ///
    /// Returns `Ok(None)` without touching the store when no item set directory
    /// exists for the source.
    pub async fn load(
        &self,
        tracker: &mut RunTracker,
        source_id: &str,
        options: ApplyOptions,
    ) -> Result<Option<ReconcileReport>> {
        let dir = self.config.items_dir_for(source_id);
        let Some(sets) = load_item_sets_in(&dir)? else {
            warn!(dir = %dir.display(), "no item sets found; skipping load");
            return Ok(None);
        };

        let drafts = sets
            .into_iter()
            .flat_map(|(_, set)| set.items)
            .collect::<Vec<ItemDraft>>();
        if !tracker.observed(Stage::Extract) {
            tracker.record_stage_count(Stage::Extract, drafts.len() as u64);
        }

        let report = self
            .store
            .apply_item_set(source_id, &drafts, options)
            .await
            .with_context(|| format!("loading items of {source_id}"))?;
        tracker.record_stage_count(Stage::Load, report.loaded() as u64);
        Ok(Some(report))
    }

    pub async fn summary(&self) -> Result<HistorySummary> {
        let histories = self.history.all().await.context("reading run history")?;
        let registered = self
            .registry
            .sources
            .iter()
            .map(|s| (s.source_id.as_str(), s.display_name.as_str()));
        Ok(HistorySummary::build(&histories, registered))
    }
}

/// Build the scheduler running the full pipeline on `capture_cron`, if scheduling is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().capture_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let batch = pipeline.run_all(RunMode::Full, ApplyOptions::default()).await;
            info!(
                succeeded = batch.runs.len(),
                failed = batch.failures.len(),
                "scheduled run finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Wire a pipeline from environment configuration: registry, history file and item store.
pub async fn pipeline_from_env() -> Result<Pipeline> {
    pipeline_from_config(PipelineConfig::from_env()).await
}

pub async fn pipeline_from_config(config: PipelineConfig) -> Result<Pipeline> {
    let registry = SourceRegistry::load(config.sources_file())?;
    let history: Arc<dyn HistoryStore> =
        Arc::new(YamlHistoryStore::new(config.history_file.clone()));
    let store = StoreReconciler::connect(&config.database_url)
        .await
        .with_context(|| format!("opening item store {}", config.database_url))?;
    Pipeline::new(config, registry, history, store)
}
