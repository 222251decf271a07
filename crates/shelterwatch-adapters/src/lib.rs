//! Extraction adapter boundary, item-set handoff files, and capture heuristics.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scraper::Selector;
use serde::{Deserialize, Serialize};
use shelterwatch_core::{ItemDraft, RawCapture};
use thiserror::Error;

pub mod adoption;
pub mod count_oracle;
pub mod render_detect;

pub use count_oracle::{CountEstimate, CountOracle, Estimator};
pub use render_detect::{classify, RenderDetection, RenderSignals};

pub const CRATE_NAME: &str = "shelterwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("capture for source_id={capture} handed to adapter for source_id={adapter}")]
    SourceMismatch { adapter: String, capture: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source-specific extraction rules turning one raw capture into candidate items.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn extractor_version(&self) -> &str {
        "unversioned"
    }

    fn extract(&self, capture: &RawCapture) -> Result<Vec<ItemDraft>, AdapterError>;

    /// Run `extract` after checking the capture belongs to this adapter.
    fn extract_checked(&self, capture: &RawCapture) -> Result<Vec<ItemDraft>, AdapterError> {
        if capture.source_id != self.source_id() {
            return Err(AdapterError::SourceMismatch {
                adapter: self.source_id().to_string(),
                capture: capture.source_id.clone(),
            });
        }
        self.extract(capture)
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("invalid selector `{selector}`: {e}")))
}

/// Adapters available in-process, keyed by the source they extract.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter`, replacing any adapter already registered for its source.
    pub fn register(&mut self, adapter: impl SourceAdapter + 'static) -> &mut Self {
        self.adapters
            .insert(adapter.source_id().to_string(), Arc::new(adapter));
        self
    }

    pub fn adapter_for_source(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Handoff document written by the extract stage and read by the load stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSetFile {
    pub meta: ItemSetMeta,
    #[serde(default)]
    pub items: Vec<ItemDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSetMeta {
    pub source_id: String,
    #[serde(default)]
    pub source_url: Option<String>,
    pub extracted_at: DateTime<Utc>,
    #[serde(default = "default_extractor_version")]
    pub extractor_version: String,
}

fn default_extractor_version() -> String {
    "unversioned".to_string()
}

impl ItemSetFile {
    pub fn new(meta: ItemSetMeta, items: Vec<ItemDraft>) -> Self {
        Self { meta, items }
    }
}

pub fn load_item_set(path: impl AsRef<Path>) -> Result<ItemSetFile> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn item_set_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

/// Load every `*.yaml` / `*.yml` item set in `dir`, ordered by file name.
///
/// Returns `Ok(None)` when the directory does not exist, which callers treat as
/// "extract stage never ran" rather than "extract stage found nothing".
pub fn load_item_sets_in(dir: impl AsRef<Path>) -> Result<Option<Vec<(PathBuf, ItemSetFile)>>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut sets = Vec::new();
    for path in item_set_paths(dir)? {
        let set = load_item_set(&path)?;
        sets.push((path, set));
    }
    Ok(Some(sets))
}

/// Write an item set as `<dir>/<YYYYMMDD_HHMMSS>_items.yaml`, replacing older sets in `dir`.
pub fn write_item_set(dir: impl AsRef<Path>, set: &ItemSetFile) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    for stale in item_set_paths(dir)? {
        fs::remove_file(&stale).with_context(|| format!("removing stale {}", stale.display()))?;
    }

    let stamp = set.meta.extracted_at.format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{stamp}_items.yaml"));
    let text = serde_yaml::to_string(set).context("serializing item set")?;
    fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    struct FixedAdapter;

    impl SourceAdapter for FixedAdapter {
        fn source_id(&self) -> &str {
            "chiba/chiba-city-cats"
        }

        fn extract(&self, _capture: &RawCapture) -> Result<Vec<ItemDraft>, AdapterError> {
            Ok(vec![ItemDraft {
                external_id: Some("C-1".into()),
                ..Default::default()
            }])
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 30, 0).single().unwrap()
    }

    #[test]
    fn extract_checked_rejects_foreign_capture() {
        let capture =
            RawCapture::new("toyama/toyama-pref-dogs", "https://example.org", "<html/>", ts());
        let err = FixedAdapter.extract_checked(&capture).unwrap_err();
        assert!(matches!(err, AdapterError::SourceMismatch { .. }));

        let own = RawCapture::new("chiba/chiba-city-cats", "https://example.org", "<html/>", ts());
        assert_eq!(FixedAdapter.extract_checked(&own).unwrap().len(), 1);
    }

    #[test]
    fn registry_finds_adapters_by_source() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());
        registry.register(FixedAdapter);
        assert_eq!(registry.len(), 1);
        assert!(registry.adapter_for_source("chiba/chiba-city-cats").is_some());
        assert!(registry.adapter_for_source("toyama/toyama-pref-dogs").is_none());
    }

    #[test]
    fn selector_errors_name_the_selector() {
        assert!(parse_selector("table tr").is_ok());
        let err = parse_selector("div[").unwrap_err();
        assert!(err.to_string().contains("div["));
    }

    #[test]
    fn item_sets_replace_previous_files() {
        let dir = tempdir().unwrap();
        let meta = ItemSetMeta {
            source_id: "chiba/chiba-city-cats".into(),
            source_url: None,
            extracted_at: ts(),
            extractor_version: "v1".into(),
        };
        let draft = ItemDraft {
            external_id: Some("C-1".into()),
            name: Some("Tama".into()),
            ..Default::default()
        };
        write_item_set(dir.path(), &ItemSetFile::new(meta.clone(), vec![draft.clone()])).unwrap();

        let later = ItemSetMeta {
            extracted_at: ts() + chrono::Duration::hours(1),
            ..meta
        };
        write_item_set(dir.path(), &ItemSetFile::new(later, vec![draft.clone(), draft])).unwrap();

        let sets = load_item_sets_in(dir.path()).unwrap().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].1.items.len(), 2);
        assert_eq!(sets[0].1.items[0].name.as_deref(), Some("Tama"));
    }

    #[test]
    fn missing_item_dir_is_not_an_empty_set() {
        let dir = tempdir().unwrap();
        assert!(load_item_sets_in(dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn hand_written_item_set_parses_with_defaults() {
        let yaml = r#"
meta:
  source_id: okinawa/naha-city
  extracted_at: 2026-03-01T06:00:00Z
items:
  - external_id: N-7
    name: Mugi
    animal_type: dog
    images: ["https://example.org/a.jpg"]
  - name: Unnamed
    needs_review: true
"#;
        let set: ItemSetFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(set.meta.extractor_version, "unversioned");
        assert_eq!(set.items.len(), 2);
        assert!(set.items[1].needs_review);
        assert!(set.items[1].external_id.is_none());
    }
}
