//! Roll-up of every source's latest run, for operators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelterwatch_core::{SourceHealth, SourceHistory};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatusLine {
    pub source_id: String,
    pub display_name: Option<String>,
    pub health: SourceHealth,
    pub last_run_at: Option<DateTime<Utc>>,
    pub load_count: Option<u64>,
    /// Error message for failing sources, drop warning for mismatched ones.
    pub detail: Option<String>,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySummary {
    pub healthy: Vec<SourceStatusLine>,
    pub failing: Vec<SourceStatusLine>,
    pub mismatch: Vec<SourceStatusLine>,
    pub empty: Vec<SourceStatusLine>,
    pub not_run: Vec<SourceStatusLine>,
}

impl HistorySummary {
    /// Group sources by the status of their newest run.
    ///
    /// `registered` lists configured sources as `(source_id, display_name)`; those
    /// without any history are reported as not run.
    pub fn build<'a>(
        histories: &BTreeMap<String, SourceHistory>,
        registered: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut summary = Self::default();

        for (source_id, history) in histories {
            let latest = history.latest_run();
            let health = history.health();
            let detail = latest.and_then(|run| match health {
                SourceHealth::Failing => run.error_message.clone(),
                SourceHealth::Mismatch => run.warning.clone(),
                _ => None,
            });
            summary.push(SourceStatusLine {
                source_id: source_id.clone(),
                display_name: history.display_name.clone(),
                health,
                last_run_at: latest.map(|run| run.timestamp),
                load_count: latest.map(|run| run.stage_counts.load_count),
                detail,
                verified: history.verified,
            });
        }

        for (source_id, display_name) in registered {
            if histories.contains_key(source_id) {
                continue;
            }
            summary.push(SourceStatusLine {
                source_id: source_id.to_string(),
                display_name: Some(display_name.to_string()),
                health: SourceHealth::NotRun,
                last_run_at: None,
                load_count: None,
                detail: None,
                verified: false,
            });
        }

        summary.not_run.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        summary
    }

    fn push(&mut self, line: SourceStatusLine) {
        let bucket = match line.health {
            SourceHealth::Healthy => &mut self.healthy,
            SourceHealth::Failing => &mut self.failing,
            SourceHealth::Mismatch => &mut self.mismatch,
            SourceHealth::Empty => &mut self.empty,
            SourceHealth::NotRun => &mut self.not_run,
        };
        bucket.push(line);
    }

    pub fn total(&self) -> usize {
        self.healthy.len()
            + self.failing.len()
            + self.mismatch.len()
            + self.empty.len()
            + self.not_run.len()
    }

    pub fn needs_attention(&self) -> bool {
        !self.failing.is_empty() || !self.mismatch.is_empty()
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Shelterwatch Source Summary".to_string(),
            String::new(),
            format!("- sources: {}", self.total()),
            format!("- healthy: {}", self.healthy.len()),
            format!("- failing: {}", self.failing.len()),
            format!("- mismatch: {}", self.mismatch.len()),
            format!("- empty: {}", self.empty.len()),
            format!("- not run: {}", self.not_run.len()),
        ];

        for (title, bucket) in [
            ("Failing", &self.failing),
            ("Mismatch", &self.mismatch),
            ("Empty", &self.empty),
            ("Not run", &self.not_run),
        ] {
            if bucket.is_empty() {
                continue;
            }
            lines.push(String::new());
            lines.push(format!("## {title}"));
            for line in bucket {
                let label = match &line.display_name {
                    Some(name) => format!("`{}` ({name})", line.source_id),
                    None => format!("`{}`", line.source_id),
                };
                let mut text = format!("- {label}");
                if let Some(at) = line.last_run_at {
                    text.push_str(&format!(" last run {}", at.format("%Y-%m-%d %H:%M UTC")));
                }
                if let Some(detail) = &line.detail {
                    text.push_str(&format!(": {detail}"));
                }
                lines.push(text);
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }
}
