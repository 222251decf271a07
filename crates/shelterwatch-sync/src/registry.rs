//! Typed source registry loaded from `sources.yaml`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use shelterwatch_adapters::parse_selector;
use shelterwatch_core::CaptureHints;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source entry with an empty source_id")]
    EmptySourceId,
    #[error("source `{0}` is listed more than once")]
    DuplicateSource(String),
    #[error("source `{source_id}` has invalid base_url `{url}`: {reason}")]
    InvalidUrl {
        source_id: String,
        url: String,
        reason: String,
    },
    #[error("source `{source_id}` has invalid selector `{selector}`")]
    InvalidSelector { source_id: String, selector: String },
    #[error("unknown source `{0}`")]
    UnknownSource(String),
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub municipality_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expected_selectors: Vec<String>,
    #[serde(default)]
    pub heading_keywords: Vec<String>,
}

impl SourceConfig {
    pub fn hints(&self) -> CaptureHints {
        CaptureHints {
            expected_selectors: self.expected_selectors.clone(),
            heading_keywords: self.heading_keywords.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.source_id.trim().is_empty() {
            return Err(ConfigError::EmptySourceId);
        }

        let invalid_url = |reason: String| ConfigError::InvalidUrl {
            source_id: self.source_id.clone(),
            url: self.base_url.clone(),
            reason,
        };
        let url = Url::parse(&self.base_url).map_err(|e| invalid_url(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid_url(format!("unsupported scheme `{}`", url.scheme())));
        }

        for selector in &self.expected_selectors {
            if parse_selector(selector).is_err() {
                return Err(ConfigError::InvalidSelector {
                    source_id: self.source_id.clone(),
                    selector: selector.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        registry.validate()?;
        Ok(registry)
    }

    /// Check ids are unique, URLs parse and every hint selector is valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .ok_or_else(|| ConfigError::UnknownSource(source_id.to_string()))
    }
}
