//! On-disk archive of raw captures, one directory per source.
//!
//! Layout under `<root>/<source_id>/`:
//! - `<YYYYMMDD_HHMMSS>_<hash8>.html` for captures that held items
//! - `latest_empty.html`, overwritten by every capture that held none
//! - `latest_metadata.json` describing the newest capture
//! - `static_EMPTY_WARNING.html` + `detection_result.json` for suspected script shells

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelterwatch_core::RawCapture;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LATEST_EMPTY_FILE: &str = "latest_empty.html";
pub const LATEST_METADATA_FILE: &str = "latest_metadata.json";
pub const RENDER_WARNING_FILE: &str = "static_EMPTY_WARNING.html";
pub const DETECTION_RESULT_FILE: &str = "detection_result.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedKind {
    Listing,
    Empty,
}

#[derive(Debug, Clone)]
pub struct ArchivedCapture {
    pub kind: ArchivedKind,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// An identical listing capture with the same timestamp was already on disk.
    pub deduplicated: bool,
}

/// Contents of `latest_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub source_id: String,
    pub url: String,
    pub captured_at: DateTime<Utc>,
    pub byte_size: usize,
    pub content_hash: String,
    pub item_count: usize,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct CaptureArchive {
    root: PathBuf,
}

impl CaptureArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    pub fn listing_file_name(captured_at: DateTime<Utc>, content_hash: &str) -> String {
        let stamp = captured_at.format("%Y%m%d_%H%M%S");
        let short = content_hash.get(..8).unwrap_or(content_hash);
        format!("{stamp}_{short}.html")
    }

    /// Archive a capture and refresh the source's `latest_metadata.json`.
    ///
    /// `item_count` is the expected count for the capture; zero routes the body to
    /// `latest_empty.html` instead of a timestamped file.
    pub async fn store(
        &self,
        capture: &RawCapture,
        item_count: usize,
    ) -> anyhow::Result<ArchivedCapture> {
        let dir = self.source_dir(&capture.source_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture directory {}", dir.display()))?;

        let bytes = capture.body.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let (kind, file_name) = if item_count == 0 {
            (ArchivedKind::Empty, LATEST_EMPTY_FILE.to_string())
        } else {
            (
                ArchivedKind::Listing,
                Self::listing_file_name(capture.captured_at, &content_hash),
            )
        };
        let absolute_path = dir.join(&file_name);
        let relative_path = PathBuf::from(&capture.source_id).join(&file_name);

        let deduplicated = kind == ArchivedKind::Listing
            && fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking capture path {}", absolute_path.display()))?;
        if deduplicated {
            debug!(path = %absolute_path.display(), "identical capture already archived");
        } else {
            write_atomic(&absolute_path, bytes).await?;
        }

        let metadata = CaptureMetadata {
            source_id: capture.source_id.clone(),
            url: capture.url.clone(),
            captured_at: capture.captured_at,
            byte_size: bytes.len(),
            content_hash: content_hash.clone(),
            item_count,
            file_name,
        };
        let json = serde_json::to_vec_pretty(&metadata).context("serializing capture metadata")?;
        write_atomic(&dir.join(LATEST_METADATA_FILE), &json).await?;

        Ok(ArchivedCapture {
            kind,
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Keep a copy of a capture suspected to be a script-rendered shell, next to
    /// the detection that flagged it.
    pub async fn store_render_warning<T: Serialize>(
        &self,
        capture: &RawCapture,
        detection: &T,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.source_dir(&capture.source_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture directory {}", dir.display()))?;

        let html_path = dir.join(RENDER_WARNING_FILE);
        write_atomic(&html_path, capture.body.as_bytes()).await?;
        let json = serde_json::to_vec_pretty(detection).context("serializing render detection")?;
        write_atomic(&dir.join(DETECTION_RESULT_FILE), &json).await?;

        warn!(
            source_id = %capture.source_id,
            path = %html_path.display(),
            "capture looks script-rendered; kept for review"
        );
        Ok(html_path)
    }

    pub async fn latest_metadata(
        &self,
        source_id: &str,
    ) -> anyhow::Result<Option<CaptureMetadata>> {
        let path = self.source_dir(source_id).join(LATEST_METADATA_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let metadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(metadata))
    }
}

/// Write through a uniquely named temp file in the target directory, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
