//! Per-source run history, persisted as one YAML document keyed by source id.
//!
//! Every write is a read-modify-write of the whole document. Within a process the
//! store holds a mutex across that cycle; across processes the document carries a
//! revision counter which is re-read right before the temp file is renamed into
//! place. A changed revision discards the attempt and starts over. The re-read and
//! the rename are two steps, so a writer in another process that renames in between
//! still wins; the check narrows cross-process races, it does not exclude them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelterwatch_core::{RunEntry, SourceHistory};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading history file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing history file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("serializing history document: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("writing history file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {path} changed underneath {attempts} consecutive write attempts")]
    Contended { path: PathBuf, attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryMetadata {
    pub last_updated: Option<DateTime<Utc>>,
    pub total_sources: usize,
    pub revision: u64,
}

/// On-disk layout of the history file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryDocument {
    pub metadata: HistoryMetadata,
    pub sources: BTreeMap<String, SourceHistory>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<SourceHistory>, HistoryError>;

    /// Atomically fold `entry` into the source's history, creating the source if needed.
    async fn record_run(
        &self,
        source_id: &str,
        entry: RunEntry,
    ) -> Result<SourceHistory, HistoryError>;

    async fn all(&self) -> Result<BTreeMap<String, SourceHistory>, HistoryError>;
}

#[derive(Debug)]
pub struct YamlHistoryStore {
    path: PathBuf,
    write_attempts: usize,
    lock: Mutex<()>,
    #[cfg(test)]
    before_commit: Option<fn(&Path)>,
}

impl YamlHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            lock: Mutex::new(()),
            #[cfg(test)]
            before_commit: None,
        }
    }

    /// Run `hook` on the document path between writing the temp file and the revision re-check.
    #[cfg(test)]
    fn with_commit_hook(mut self, hook: fn(&Path)) -> Self {
        self.before_commit = Some(hook);
        self
    }

    pub fn with_write_attempts(mut self, attempts: usize) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document; a missing or blank file is an empty history.
    pub async fn read_document(&self) -> Result<HistoryDocument, HistoryError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryDocument::default())
            }
            Err(source) => {
                return Err(HistoryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(HistoryDocument::default());
        }
        serde_yaml::from_str(&text).map_err(|source| HistoryError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Update the operator-facing label of a source without touching its counters.
    pub async fn set_display_name(
        &self,
        source_id: &str,
        display_name: Option<String>,
    ) -> Result<SourceHistory, HistoryError> {
        self.modify(source_id, |history| history.display_name = display_name.clone())
            .await
    }

    async fn modify<F>(&self, source_id: &str, mut apply: F) -> Result<SourceHistory, HistoryError>
    where
        F: FnMut(&mut SourceHistory) + Send,
    {
        let _guard = self.lock.lock().await;

        for attempt in 1..=self.write_attempts {
            let mut doc = self.read_document().await?;
            let base_revision = doc.metadata.revision;

            let history = doc.sources.entry(source_id.to_string()).or_default();
            apply(history);
            let updated = history.clone();

            doc.metadata.revision = base_revision + 1;
            doc.metadata.last_updated = Some(Utc::now());
            doc.metadata.total_sources = doc.sources.len();

            let text = serde_yaml::to_string(&doc).map_err(HistoryError::Serialize)?;
            let temp_path = self.write_temp(&text).await?;

            #[cfg(test)]
            if let Some(hook) = self.before_commit {
                hook(&self.path);
            }

            let current = self.read_document().await.map(|d| d.metadata.revision);
            match current {
                Ok(revision) if revision == base_revision => {
                    if let Err(source) = fs::rename(&temp_path, &self.path).await {
                        let _ = fs::remove_file(&temp_path).await;
                        return Err(HistoryError::Write {
                            path: self.path.clone(),
                            source,
                        });
                    }
                    debug!(
                        source_id,
                        revision = doc.metadata.revision,
                        "history document written"
                    );
                    return Ok(updated);
                }
                Ok(revision) => {
                    let _ = fs::remove_file(&temp_path).await;
                    warn!(
                        source_id,
                        attempt,
                        expected = base_revision,
                        found = revision,
                        "history file changed during update; retrying"
                    );
                }
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            }
        }

        Err(HistoryError::Contended {
            path: self.path.clone(),
            attempts: self.write_attempts,
        })
    }

    async fn write_temp(&self, text: &str) -> Result<PathBuf, HistoryError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let write_err = |source| HistoryError::Write {
            path: self.path.clone(),
            source,
        };

        fs::create_dir_all(&parent).await.map_err(write_err)?;
        let temp_path = parent.join(format!(".{}.history.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err)?;
        file.write_all(text.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        Ok(temp_path)
    }
}

#[async_trait]
impl HistoryStore for YamlHistoryStore {
    async fn load(&self, source_id: &str) -> Result<Option<SourceHistory>, HistoryError> {
        Ok(self.read_document().await?.sources.remove(source_id))
    }

    async fn record_run(
        &self,
        source_id: &str,
        entry: RunEntry,
    ) -> Result<SourceHistory, HistoryError> {
        self.modify(source_id, |history| history.apply_run(entry.clone()))
            .await
    }

    async fn all(&self) -> Result<BTreeMap<String, SourceHistory>, HistoryError> {
        Ok(self.read_document().await?.sources)
    }
}

/// Process-local history, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    sources: Mutex<BTreeMap<String, SourceHistory>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load(&self, source_id: &str) -> Result<Option<SourceHistory>, HistoryError> {
        Ok(self.sources.lock().await.get(source_id).cloned())
    }

    async fn record_run(
        &self,
        source_id: &str,
        entry: RunEntry,
    ) -> Result<SourceHistory, HistoryError> {
        let mut sources = self.sources.lock().await;
        let history = sources.entry(source_id.to_string()).or_default();
        history.apply_run(entry);
        Ok(history.clone())
    }

    async fn all(&self) -> Result<BTreeMap<String, SourceHistory>, HistoryError> {
        Ok(self.sources.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shelterwatch_core::{RunStatus, StageCounts, RECENT_RUNS_LIMIT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(status: RunStatus, load_count: u64) -> RunEntry {
        RunEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            status,
            stage_counts: StageCounts {
                capture_count: load_count,
                extract_count: load_count,
                load_count,
            },
            error_message: None,
            warning: None,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_history() {
        let dir = tempdir().unwrap();
        let store = YamlHistoryStore::new(dir.path().join("history.yaml"));
        assert!(store.load("a/b").await.unwrap().is_none());
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_run_creates_source_and_bumps_revision() {
        let dir = tempdir().unwrap();
        let store = YamlHistoryStore::new(dir.path().join("nested").join("history.yaml"));

        let history = store
            .record_run("chiba/chiba-city-cats", entry(RunStatus::Success, 4))
            .await
            .unwrap();
        assert_eq!(history.total_runs, 1);
        assert!(history.verified);

        store
            .record_run("toyama/toyama-pref-dogs", entry(RunStatus::Empty, 0))
            .await
            .unwrap();

        let doc = store.read_document().await.unwrap();
        assert_eq!(doc.metadata.revision, 2);
        assert_eq!(doc.metadata.total_sources, 2);
        assert!(doc.metadata.last_updated.is_some());
        assert!(!doc.sources["toyama/toyama-pref-dogs"].verified);
    }

    #[tokio::test]
    async fn display_name_survives_run_bookkeeping() {
        let dir = tempdir().unwrap();
        let store = YamlHistoryStore::new(dir.path().join("history.yaml"));
        store
            .set_display_name("okinawa/naha-city", Some("那覇市動物愛護センター".into()))
            .await
            .unwrap();
        let history = store
            .record_run("okinawa/naha-city", entry(RunStatus::Success, 2))
            .await
            .unwrap();
        assert_eq!(history.display_name.as_deref(), Some("那覇市動物愛護センター"));
        assert_eq!(history.total_runs, 1);
    }

    #[tokio::test]
    async fn hand_written_document_loads_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.yaml");
        std::fs::write(
            &path,
            "sources:\n  kanagawa/yokohama:\n    display_name: Yokohama\n    total_runs: 3\n",
        )
        .unwrap();
        let store = YamlHistoryStore::new(&path);
        let history = store.load("kanagawa/yokohama").await.unwrap().unwrap();
        assert_eq!(history.total_runs, 3);
        assert!(history.recent_runs.is_empty());

        let updated = store
            .record_run("kanagawa/yokohama", entry(RunStatus::Success, 1))
            .await
            .unwrap();
        assert_eq!(updated.total_runs, 4);
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error_not_a_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.yaml");
        std::fs::write(&path, "sources: [not, a, map").unwrap();
        let store = YamlHistoryStore::new(&path);
        let err = store
            .record_run("a/b", entry(RunStatus::Success, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Parse { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sources: [not, a, map");
    }

    #[tokio::test]
    async fn concurrent_writers_lose_no_runs() {
        let dir = tempdir().unwrap();
        let store = Arc::new(YamlHistoryStore::new(dir.path().join("history.yaml")));

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .record_run("shared/source", entry(RunStatus::Success, i + 1))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = store.load("shared/source").await.unwrap().unwrap();
        assert_eq!(history.total_runs, 12);
        assert_eq!(history.success_count, 12);
        assert_eq!(history.recent_runs.len(), RECENT_RUNS_LIMIT);

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    /// Stand-in for a writer in another process finishing its own update.
    fn bump_revision_on_disk(path: &Path) {
        let mut doc: HistoryDocument = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_default();
        doc.metadata.revision += 1;
        std::fs::write(path, serde_yaml::to_string(&doc).unwrap()).unwrap();
    }

    static FOREIGN_WRITES: AtomicUsize = AtomicUsize::new(0);

    fn bump_revision_once(path: &Path) {
        if FOREIGN_WRITES.fetch_add(1, Ordering::SeqCst) == 0 {
            bump_revision_on_disk(path);
        }
    }

    #[tokio::test]
    async fn changed_revision_discards_the_attempt_and_retries() {
        let dir = tempdir().unwrap();
        let store = YamlHistoryStore::new(dir.path().join("history.yaml"))
            .with_commit_hook(bump_revision_once);

        let history = store
            .record_run("chiba/cats", entry(RunStatus::Success, 3))
            .await
            .unwrap();
        assert_eq!(history.total_runs, 1);
        assert_eq!(FOREIGN_WRITES.load(Ordering::SeqCst), 2);

        let doc = store.read_document().await.unwrap();
        assert_eq!(doc.metadata.revision, 2);
        assert_eq!(doc.sources["chiba/cats"].total_runs, 1);
    }

    #[tokio::test]
    async fn persistent_contention_gives_up_without_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.yaml");
        let store = YamlHistoryStore::new(&path)
            .with_write_attempts(1)
            .with_commit_hook(bump_revision_on_disk);

        let err = store
            .record_run("chiba/cats", entry(RunStatus::Success, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Contended { attempts: 1, .. }));

        let doc = store.read_document().await.unwrap();
        assert_eq!(doc.metadata.revision, 1);
        assert!(doc.sources.is_empty());

        let files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["history.yaml"]);
    }

    #[tokio::test]
    async fn in_memory_store_applies_runs() {
        let store = InMemoryHistoryStore::new();
        store
            .record_run("a/b", entry(RunStatus::Error, 0))
            .await
            .unwrap();
        let history = store.load("a/b").await.unwrap().unwrap();
        assert_eq!(history.error_count, 1);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }
}
