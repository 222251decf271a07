//! Core domain model for shelterwatch: stage counts, run history, items and raw captures.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "shelterwatch-core";

/// Maximum number of run entries retained per source, newest first.
pub const RECENT_RUNS_LIMIT: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized {kind} value `{value}`")]
pub struct ParseValueError {
    pub kind: &'static str,
    pub value: String,
}

/// One of the three pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Capture,
    Extract,
    Load,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Capture, Stage::Extract, Stage::Load];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Capture => "Capture",
            Stage::Extract => "Extract",
            Stage::Load => "Load",
        }
    }

    /// Stages that run before this one, nearest first.
    pub fn earlier(self) -> impl Iterator<Item = Stage> {
        Self::ALL.into_iter().filter(move |s| *s < self).rev()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Mismatch,
    Empty,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Mismatch => "mismatch",
            RunStatus::Empty => "empty",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Items observed at each stage of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCounts {
    pub capture_count: u64,
    pub extract_count: u64,
    pub load_count: u64,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Capture => self.capture_count,
            Stage::Extract => self.extract_count,
            Stage::Load => self.load_count,
        }
    }

    pub fn set(&mut self, stage: Stage, count: u64) {
        match stage {
            Stage::Capture => self.capture_count = count,
            Stage::Extract => self.extract_count = count,
            Stage::Load => self.load_count = count,
        }
    }

    pub fn is_all_zero(&self) -> bool {
        Stage::ALL.iter().all(|s| self.get(*s) == 0)
    }
}

/// Immutable snapshot of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(flatten)]
    pub stage_counts: StageCounts,
    pub error_message: Option<String>,
    pub warning: Option<String>,
    pub duration_ms: u64,
}

/// Health of a source as shown on operational dashboards, derived from its newest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Empty,
    Mismatch,
    Failing,
    NotRun,
}

impl From<RunStatus> for SourceHealth {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => SourceHealth::Healthy,
            RunStatus::Empty => SourceHealth::Empty,
            RunStatus::Mismatch => SourceHealth::Mismatch,
            RunStatus::Error => SourceHealth::Failing,
        }
    }
}

/// Persisted per-source run bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceHistory {
    /// Operator-maintained label; never touched by run bookkeeping.
    pub display_name: Option<String>,
    pub verified: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub total_runs: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub mismatch_count: u64,
    pub recent_runs: Vec<RunEntry>,
}

impl SourceHistory {
    /// Fold a finished run into the counters and the bounded run list.
    ///
    /// Mismatch runs are successes that also bump `mismatch_count`; only error
    /// runs land in the error bucket.
    pub fn apply_run(&mut self, entry: RunEntry) {
        self.total_runs += 1;

        match entry.status {
            RunStatus::Success | RunStatus::Empty | RunStatus::Mismatch => {
                self.success_count += 1;
                self.last_success_at = Some(entry.timestamp);
                if !entry.stage_counts.is_all_zero() {
                    self.verified = true;
                }
            }
            RunStatus::Error => {
                self.error_count += 1;
                self.last_error_at = Some(entry.timestamp);
                self.last_error_message = entry.error_message.clone();
            }
        }
        if entry.status == RunStatus::Mismatch {
            self.mismatch_count += 1;
        }

        self.recent_runs.insert(0, entry);
        self.recent_runs.truncate(RECENT_RUNS_LIMIT);
    }

    pub fn latest_run(&self) -> Option<&RunEntry> {
        self.recent_runs.first()
    }

    pub fn health(&self) -> SourceHealth {
        self.latest_run()
            .map(|run| SourceHealth::from(run.status))
            .unwrap_or(SourceHealth::NotRun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimalType {
    Cat,
    Dog,
    Other,
    #[default]
    Unknown,
}

impl AnimalType {
    pub fn as_str(self) -> &'static str {
        match self {
            AnimalType::Cat => "cat",
            AnimalType::Dog => "dog",
            AnimalType::Other => "other",
            AnimalType::Unknown => "unknown",
        }
    }
}

impl FromStr for AnimalType {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cat" => Ok(AnimalType::Cat),
            "dog" => Ok(AnimalType::Dog),
            "other" => Ok(AnimalType::Other),
            "unknown" => Ok(AnimalType::Unknown),
            _ => Err(ParseValueError {
                kind: "animal type",
                value: s.to_string(),
            }),
        }
    }
}

/// Listing state of a stored item. Rows are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Available,
    Adopted,
    Removed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Adopted => "adopted",
            ItemStatus::Removed => "removed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ItemStatus::Available),
            "adopted" => Ok(ItemStatus::Adopted),
            "removed" => Ok(ItemStatus::Removed),
            _ => Err(ParseValueError {
                kind: "item status",
                value: s.to_string(),
            }),
        }
    }
}

/// Candidate record handed over by an extraction adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemDraft {
    pub external_id: Option<String>,
    pub name: Option<String>,
    pub animal_type: Option<AnimalType>,
    pub breed: Option<String>,
    pub age_estimate: Option<String>,
    pub gender: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub health_status: Option<String>,
    pub personality: Option<String>,
    pub special_needs: Option<String>,
    pub images: Vec<String>,
    pub protection_date: Option<NaiveDate>,
    pub deadline_date: Option<NaiveDate>,
    pub status: Option<ItemStatus>,
    /// Free text near the record that may announce an adoption.
    pub status_text: Option<String>,
    pub source_url: Option<String>,
    pub extraction_error: bool,
    pub needs_review: bool,
}

/// Mutable, overwritable part of a stored item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemFields {
    pub name: String,
    pub animal_type: AnimalType,
    pub breed: Option<String>,
    pub age_estimate: Option<String>,
    pub gender: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub health_status: Option<String>,
    pub personality: Option<String>,
    pub special_needs: Option<String>,
    pub images: Vec<String>,
    pub protection_date: Option<NaiveDate>,
    pub deadline_date: Option<NaiveDate>,
    pub status: ItemStatus,
    pub source_url: Option<String>,
}

/// Item ready to be upserted under its (source, external_id) identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub source_id: String,
    pub external_id: String,
    pub fields: ItemFields,
}

/// Item row as persisted in the item store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredItem {
    pub id: i64,
    pub source_id: String,
    pub external_id: String,
    pub fields: ItemFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Markup snapshot taken by the capture stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCapture {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub captured_at: DateTime<Utc>,
}

impl RawCapture {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        body: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            body: body.into(),
            captured_at,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.body.len()
    }
}

/// Source-specific expectations about what a correctly rendered capture contains.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureHints {
    pub expected_selectors: Vec<String>,
    pub heading_keywords: Vec<String>,
}
