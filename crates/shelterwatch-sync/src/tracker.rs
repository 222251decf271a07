//! Per-invocation bookkeeping of stage counts, drops and errors for one source.
//!
//! A run may span several process invocations: a later stage calls
//! [`RunTracker::load_carried_counts`] to pick up the counts the previous run of the
//! same source recorded, so drops are still detected across the boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use shelterwatch_core::{RunEntry, RunStatus, Stage, StageCounts};
use shelterwatch_storage::HistoryStore;
use tracing::{error, info, info_span, warn, Span};
use uuid::Uuid;

pub struct RunTracker {
    source_id: String,
    run_id: Uuid,
    history: Arc<dyn HistoryStore>,
    started: Option<Instant>,
    counts: BTreeMap<Stage, u64>,
    observed: BTreeSet<Stage>,
    error: Option<String>,
    warnings: Vec<String>,
    span: Span,
}

impl RunTracker {
    pub fn new(source_id: impl Into<String>, history: Arc<dyn HistoryStore>) -> Self {
        let source_id = source_id.into();
        let run_id = Uuid::new_v4();
        let span = info_span!("source_run", %run_id, source_id = %source_id);
        Self {
            source_id,
            run_id,
            history,
            started: None,
            counts: BTreeMap::new(),
            observed: BTreeSet::new(),
            error: None,
            warnings: Vec::new(),
            span,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Span carrying `run_id` and `source_id`, for instrumenting the run's stages.
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        info!(parent: &self.span, "run started");
    }

    /// Seed counts from the newest recorded run of this source; zero counts are not carried.
    pub async fn load_carried_counts(&mut self) {
        let history = match self.history.load(&self.source_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(parent: &self.span, error = %err, "could not read history; nothing carried");
                return;
            }
        };
        let Some(last) = history.as_ref().and_then(|h| h.latest_run()) else {
            return;
        };
        for stage in Stage::ALL {
            let count = last.stage_counts.get(stage);
            if count > 0 {
                self.counts.insert(stage, count);
                info!(parent: &self.span, %stage, count, "carried count from previous run");
            }
        }
    }

    pub fn record_stage_count(&mut self, stage: Stage, count: u64) {
        let prior = stage
            .earlier()
            .find_map(|earlier| self.counts.get(&earlier).map(|c| (earlier, *c)));
        self.counts.insert(stage, count);
        self.observed.insert(stage);
        info!(parent: &self.span, %stage, count, "stage count recorded");

        if let Some((earlier, prior)) = prior {
            if count < prior {
                let warning = format!(
                    "{earlier}→{stage} dropped by {} ({prior}→{count})",
                    prior - count
                );
                warn!(parent: &self.span, %warning, "items lost between stages");
                self.warnings.push(warning);
            }
        }
    }

    /// Remember a hard failure; a later call replaces the earlier message.
    pub fn record_error(&mut self, err: impl fmt::Display) {
        let message = err.to_string();
        error!(parent: &self.span, error = %message, "stage failed");
        self.error = Some(message);
    }

    pub fn stage_count(&self, stage: Stage) -> Option<u64> {
        self.counts.get(&stage).copied()
    }

    /// Whether `stage` was recorded during this invocation, as opposed to carried or absent.
    pub fn observed(&self, stage: Stage) -> bool {
        self.observed.contains(&stage)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn stage_counts(&self) -> StageCounts {
        let mut counts = StageCounts::default();
        for (stage, count) in &self.counts {
            counts.set(*stage, *count);
        }
        counts
    }

    pub fn status(&self) -> RunStatus {
        if self.error.is_some() {
            RunStatus::Error
        } else if !self.warnings.is_empty() {
            RunStatus::Mismatch
        } else if self.stage_counts().is_all_zero() {
            RunStatus::Empty
        } else {
            RunStatus::Success
        }
    }

    /// Write the run into history. Returns the entry, or `None` when the run was never
    /// started. A history write failure is logged and otherwise ignored.
    pub async fn finalize(self) -> Option<RunEntry> {
        let Some(started) = self.started else {
            warn!(parent: &self.span, "finalize called before start; nothing recorded");
            return None;
        };

        let warning = (!self.warnings.is_empty()).then(|| self.warnings.join("; "));
        let entry = RunEntry {
            timestamp: Utc::now(),
            status: self.status(),
            stage_counts: self.stage_counts(),
            error_message: self.error.clone(),
            warning,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match self.history.record_run(&self.source_id, entry.clone()).await {
            Ok(history) => info!(
                parent: &self.span,
                status = %entry.status,
                duration_ms = entry.duration_ms,
                total_runs = history.total_runs,
                "run recorded"
            ),
            Err(err) => error!(
                parent: &self.span,
                error = %err,
                status = %entry.status,
                "failed to persist run history"
            ),
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shelterwatch_core::SourceHistory;
    use shelterwatch_storage::{HistoryError, InMemoryHistoryStore};

    fn tracker(history: &Arc<InMemoryHistoryStore>) -> RunTracker {
        RunTracker::new("chiba/chiba-city-cats", history.clone() as Arc<dyn HistoryStore>)
    }

    #[tokio::test]
    async fn stage_losses_make_a_mismatch() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut run = tracker(&history);
        run.start();
        run.record_stage_count(Stage::Capture, 20);
        run.record_stage_count(Stage::Extract, 18);
        run.record_stage_count(Stage::Load, 15);

        let entry = run.finalize().await.unwrap();
        assert_eq!(entry.status, RunStatus::Mismatch);
        assert_eq!(
            entry.warning.as_deref(),
            Some("Capture→Extract dropped by 2 (20→18); Extract→Load dropped by 3 (18→15)")
        );

        let stored = history.load("chiba/chiba-city-cats").await.unwrap().unwrap();
        assert_eq!(stored.mismatch_count, 1);
        assert_eq!(stored.success_count, 1);
        assert!(stored.verified);
    }

    #[tokio::test]
    async fn all_zero_run_is_empty_and_leaves_verified_alone() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut run = tracker(&history);
        run.start();
        for stage in Stage::ALL {
            run.record_stage_count(stage, 0);
        }
        let entry = run.finalize().await.unwrap();
        assert_eq!(entry.status, RunStatus::Empty);
        assert!(entry.warning.is_none());
        assert!(!history.load("chiba/chiba-city-cats").await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn error_wins_over_warnings() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut run = tracker(&history);
        run.start();
        run.record_stage_count(Stage::Capture, 5);
        run.record_stage_count(Stage::Extract, 1);
        run.record_error("first");
        run.record_error("connection reset");
        let entry = run.finalize().await.unwrap();
        assert_eq!(entry.status, RunStatus::Error);
        assert_eq!(entry.error_message.as_deref(), Some("connection reset"));
        assert!(entry.warning.is_some());
    }

    #[tokio::test]
    async fn drop_compares_against_nearest_recorded_stage() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut run = tracker(&history);
        run.start();
        run.record_stage_count(Stage::Capture, 10);
        run.record_stage_count(Stage::Load, 7);
        assert_eq!(run.warnings(), ["Capture→Load dropped by 3 (10→7)"]);

        let mut run = tracker(&history);
        run.record_stage_count(Stage::Capture, 0);
        run.record_stage_count(Stage::Extract, 4);
        assert!(run.warnings().is_empty());
        assert_eq!(run.status(), RunStatus::Success);
    }

    #[tokio::test]
    async fn carried_counts_take_part_in_drop_detection() {
        let history = Arc::new(InMemoryHistoryStore::new());

        let mut capture = tracker(&history);
        capture.start();
        capture.record_stage_count(Stage::Capture, 12);
        assert_eq!(capture.finalize().await.unwrap().status, RunStatus::Success);

        let mut load = tracker(&history);
        load.start();
        load.load_carried_counts().await;
        assert_eq!(load.stage_count(Stage::Capture), Some(12));
        assert_eq!(load.stage_count(Stage::Extract), None);
        assert!(!load.observed(Stage::Capture));
        load.record_stage_count(Stage::Extract, 12);
        load.record_stage_count(Stage::Load, 11);
        let entry = load.finalize().await.unwrap();

        assert_eq!(entry.status, RunStatus::Mismatch);
        assert_eq!(entry.stage_counts.capture_count, 12);
        assert_eq!(entry.warning.as_deref(), Some("Extract→Load dropped by 1 (12→11)"));
        assert_eq!(history.load("chiba/chiba-city-cats").await.unwrap().unwrap().total_runs, 2);
    }

    #[tokio::test]
    async fn finalize_without_start_records_nothing() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut run = tracker(&history);
        run.record_stage_count(Stage::Capture, 3);
        assert!(run.finalize().await.is_none());
        assert!(history.all().await.unwrap().is_empty());
    }

    struct BrokenHistory;

    #[async_trait]
    impl HistoryStore for BrokenHistory {
        async fn load(&self, _source_id: &str) -> Result<Option<SourceHistory>, HistoryError> {
            Err(HistoryError::Contended {
                path: "history.yaml".into(),
                attempts: 1,
            })
        }

        async fn record_run(
            &self,
            _source_id: &str,
            _entry: RunEntry,
        ) -> Result<SourceHistory, HistoryError> {
            Err(HistoryError::Contended {
                path: "history.yaml".into(),
                attempts: 1,
            })
        }

        async fn all(
            &self,
        ) -> Result<std::collections::BTreeMap<String, SourceHistory>, HistoryError> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn history_failures_are_swallowed() {
        let mut run = RunTracker::new("a/b", Arc::new(BrokenHistory));
        run.start();
        run.load_carried_counts().await;
        run.record_stage_count(Stage::Capture, 2);
        let entry = run.finalize().await.unwrap();
        assert_eq!(entry.status, RunStatus::Success);
    }
}
