//! Detects captures that are script-rendered shells and need a real browser.
//!
//! Five independent signals are scored; two or more mean the static capture is
//! not trustworthy.

use scraper::{Html, Selector};
use serde::Serialize;
use shelterwatch_core::{CaptureHints, RawCapture};

/// Captures below this size are suspiciously small for a listing page.
pub const SMALL_CAPTURE_BYTES: usize = 5000;

pub const DYNAMIC_THRESHOLD: u32 = 2;

const CONTENT_ROOTS: &str = "#app, #root, #__next, #__nuxt";

const FRAMEWORK_FINGERPRINTS: &[&str] = &[
    "__next_data__",
    "__nuxt",
    "data-reactroot",
    "ng-version",
    "ng-app",
    "data-v-app",
];

/// Words that name a client-side framework when they appear in a script path.
const FRAMEWORK_SCRIPT_WORDS: &[&str] = &["react", "vue", "angular", "nuxt"];

const BUNDLE_NAMES: &[&str] = &["main", "app", "bundle", "chunk"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RenderSignals {
    pub empty_root: bool,
    pub too_small: bool,
    pub spa_framework: bool,
    pub missing_content: bool,
    pub only_scripts: bool,
}

impl RenderSignals {
    pub const COUNT: u32 = 5;

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> {
        [
            ("empty_root", self.empty_root),
            ("too_small", self.too_small),
            ("spa_framework", self.spa_framework),
            ("missing_content", self.missing_content),
            ("only_scripts", self.only_scripts),
        ]
        .into_iter()
    }

    pub fn score(&self) -> u32 {
        self.iter().filter(|(_, on)| *on).count() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderDetection {
    pub requires_dynamic_rendering: bool,
    pub score: u32,
    pub max_score: u32,
    pub signals: RenderSignals,
}

impl RenderDetection {
    pub fn recommendation(&self) -> &'static str {
        if self.requires_dynamic_rendering {
            "capture with a script-executing browser"
        } else {
            "static capture is sufficient"
        }
    }

    pub fn active_signals(&self) -> Vec<&'static str> {
        self.signals
            .iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| name)
            .collect()
    }
}

pub fn classify(capture: &RawCapture, hints: &CaptureHints) -> RenderDetection {
    let document = Html::parse_document(&capture.body);
    let lowered = capture.body.to_ascii_lowercase();

    let signals = RenderSignals {
        empty_root: has_empty_content_root(&document),
        too_small: capture.byte_size() < SMALL_CAPTURE_BYTES,
        spa_framework: FRAMEWORK_FINGERPRINTS.iter().any(|fp| lowered.contains(fp))
            || has_framework_script(&document),
        missing_content: !hints.expected_selectors.is_empty()
            && expected_matches(&document, &hints.expected_selectors) == 0,
        only_scripts: has_bundle_script(&document) && !has_structural_content(&document),
    };

    let score = signals.score();
    RenderDetection {
        requires_dynamic_rendering: score >= DYNAMIC_THRESHOLD,
        score,
        max_score: RenderSignals::COUNT,
        signals,
    }
}

fn has_empty_content_root(document: &Html) -> bool {
    let Ok(sel) = Selector::parse(CONTENT_ROOTS) else {
        return false;
    };
    document.select(&sel).any(|root| {
        !root.children().any(|child| child.value().is_element())
            && root.text().all(|t| t.trim().is_empty())
    })
}

/// Total matches over the hinted selectors; unparseable selectors contribute nothing.
fn expected_matches(document: &Html, selectors: &[String]) -> usize {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s.trim()).ok())
        .map(|sel| document.select(&sel).count())
        .sum()
}

fn script_sources(document: &Html) -> Vec<String> {
    let Ok(sel) = Selector::parse("script[src]") else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|script| script.value().attr("src"))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// `vue.js`, `react-dom.production.min.js`, `/angular/core.js` and the like.
fn has_framework_script(document: &Html) -> bool {
    script_sources(document).iter().any(|src| {
        src.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| FRAMEWORK_SCRIPT_WORDS.contains(&word))
    })
}

fn has_bundle_script(document: &Html) -> bool {
    script_sources(document).iter().any(|src| {
        let file = src
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default();
        file.ends_with(".js") && BUNDLE_NAMES.iter().any(|name| file.contains(name))
    })
}

fn has_structural_content(document: &Html) -> bool {
    Selector::parse("table, article, ul")
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
}
