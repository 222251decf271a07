//! Expected item count for a raw capture, used to cross-check what adapters extract.
//!
//! The oracle walks an ordered chain of [`Estimator`]s and stops at the first one
//! that reports a positive count. Structural signals come first; keyword headings
//! are the last resort.

use scraper::{Html, Selector};
use shelterwatch_core::{CaptureHints, RawCapture};
use tracing::debug;

/// Heading keywords used when the source configures none.
pub const DEFAULT_HEADING_KEYWORDS: &[&str] = &["猫", "犬", "仮名", "管理番号"];

pub trait Estimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, document: &Html, hints: &CaptureHints) -> usize;
}

fn count_matches(document: &Html, selector: &str) -> usize {
    Selector::parse(selector)
        .map(|sel| document.select(&sel).count())
        .unwrap_or(0)
}

/// One record per table row, minus the header row.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableRowEstimator;

impl Estimator for TableRowEstimator {
    fn name(&self) -> &'static str {
        "table_rows"
    }

    fn estimate(&self, document: &Html, _hints: &CaptureHints) -> usize {
        let rows = count_matches(document, "tr");
        if rows > 1 {
            rows - 1
        } else {
            0
        }
    }
}

/// Card, box or item containers; an element matching several of those counts once.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerEstimator;

impl Estimator for ContainerEstimator {
    fn name(&self) -> &'static str {
        "containers"
    }

    fn estimate(&self, document: &Html, _hints: &CaptureHints) -> usize {
        count_matches(
            document,
            r#"div[class*="card"], div[class*="box"], div[class*="item"]"#,
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetailLinkEstimator;

impl Estimator for DetailLinkEstimator {
    fn name(&self) -> &'static str {
        "detail_links"
    }

    fn estimate(&self, document: &Html, _hints: &CaptureHints) -> usize {
        count_matches(document, r#"a[href*="detail"]"#)
    }
}

/// Largest number of headings sharing one domain keyword.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordHeadingEstimator;

impl Estimator for KeywordHeadingEstimator {
    fn name(&self) -> &'static str {
        "keyword_headings"
    }

    fn estimate(&self, document: &Html, hints: &CaptureHints) -> usize {
        let Ok(sel) = Selector::parse("h1, h2, h3, h4, h5, h6") else {
            return 0;
        };
        let headings = document
            .select(&sel)
            .map(|h| h.text().collect::<String>().to_lowercase())
            .collect::<Vec<_>>();

        let configured = hints
            .heading_keywords
            .iter()
            .map(String::as_str)
            .filter(|k| !k.trim().is_empty())
            .collect::<Vec<_>>();
        let keywords = if configured.is_empty() {
            DEFAULT_HEADING_KEYWORDS.to_vec()
        } else {
            configured
        };

        keywords
            .iter()
            .map(|keyword| {
                let needle = keyword.to_lowercase();
                headings.iter().filter(|h| h.contains(&needle)).count()
            })
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountEstimate {
    pub count: usize,
    /// Estimator that produced `count`; `None` when every estimator reported zero.
    pub estimator: Option<&'static str>,
}

pub struct CountOracle {
    estimators: Vec<Box<dyn Estimator>>,
}

impl Default for CountOracle {
    fn default() -> Self {
        Self {
            estimators: vec![
                Box::new(TableRowEstimator),
                Box::new(ContainerEstimator),
                Box::new(DetailLinkEstimator),
                Box::new(KeywordHeadingEstimator),
            ],
        }
    }
}

impl CountOracle {
    pub fn empty() -> Self {
        Self {
            estimators: Vec::new(),
        }
    }

    /// Append an estimator at the end of the chain.
    pub fn with_estimator(mut self, estimator: impl Estimator + 'static) -> Self {
        self.estimators.push(Box::new(estimator));
        self
    }

    pub fn estimator_names(&self) -> Vec<&'static str> {
        self.estimators.iter().map(|e| e.name()).collect()
    }

    pub fn estimate(&self, capture: &RawCapture, hints: &CaptureHints) -> usize {
        self.estimate_detailed(capture, hints).count
    }

    pub fn estimate_detailed(&self, capture: &RawCapture, hints: &CaptureHints) -> CountEstimate {
        let document = Html::parse_document(&capture.body);
        for estimator in &self.estimators {
            let count = estimator.estimate(&document, hints);
            if count > 0 {
                debug!(
                    source_id = %capture.source_id,
                    estimator = estimator.name(),
                    count,
                    "capture count estimated"
                );
                return CountEstimate {
                    count,
                    estimator: Some(estimator.name()),
                };
            }
        }
        CountEstimate {
            count: 0,
            estimator: None,
        }
    }
}
