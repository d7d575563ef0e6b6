//! Durable storage for accepted images.
//!
//! A [`PersistenceSink`] must be idempotent per perceptual hash: persisting
//! the same logical image twice yields [`SaveOutcome::AlreadyStored`] the
//! second time, with no second file and no second record.

#[cfg(feature = "sqlite")]
mod sqlite;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use sha3::{Digest, Sha3_256};

use crate::config::SaveFormat;
use crate::error::{CrawlError, Result};
use crate::hash::PerceptualHash;

#[cfg(feature = "sqlite")]
pub use sqlite::{BasicStats, SqliteStore, StoredImage};

/// Everything needed to store one accepted image.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub url: String,
    pub domain: String,
    pub hash: PerceptualHash,
    pub image: DynamicImage,
    /// Bytes as downloaded.
    pub original: Vec<u8>,
    pub format: Option<ImageFormat>,
    pub score: Option<f32>,
}

/// A stored image record.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedRecord {
    pub id: i64,
    pub hash: PerceptualHash,
    pub url: String,
    pub domain: String,
    pub path: PathBuf,
    pub ext: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub score: Option<f32>,
    /// SHA3-256 of the stored file contents.
    pub content_sha3: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Stored(SavedRecord),
    /// A record with this hash already exists; nothing was written.
    AlreadyStored,
}

/// Sink for accepted images.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, request: SaveRequest) -> Result<SaveOutcome>;

    /// Images already held, counted towards `target_saved_count`.
    async fn stored_count(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Bytes and extension of the file to write for `request`.
///
/// JPEG mode re-encodes at `quality`; original mode keeps the downloaded
/// bytes and falls back to JPEG when the source format is unknown.
pub fn encode_for_save(
    request: &SaveRequest,
    format: SaveFormat,
    quality: u8,
) -> Result<(Vec<u8>, String)> {
    if format == SaveFormat::Original {
        if let Some(ext) = request
            .format
            .and_then(|f| f.extensions_str().first().copied())
        {
            return Ok((request.original.clone(), ext.to_string()));
        }
    }

    let mut out = Cursor::new(Vec::new());
    let rgb = request.image.to_rgb8();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| CrawlError::Image(format!("Failed to encode JPEG: {e}")))?;
    Ok((out.into_inner(), "jpg".to_string()))
}

/// Hex SHA3-256 digest.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha3_256::digest(bytes))
}

/// Directory component for a domain; ports would make awkward folder names.
pub fn domain_dir(domain: &str) -> String {
    domain.replace(':', "_")
}

/// Write `bytes` to `path` through a temp file and rename, so readers never
/// see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CrawlError::Persistence(format!("No parent for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CrawlError::Persistence(format!("Bad file name {}", path.display())))?;
    let tmp = parent.join(format!(".{file_name}.tmp"));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Total size in bytes of the files under `root`; a missing root is empty.
pub fn folder_size(root: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

/// Whether `root` has reached `limit_mb` megabytes; a zero limit never does.
pub fn exceeds_folder_limit(root: &Path, limit_mb: u64) -> std::io::Result<bool> {
    if limit_mb == 0 {
        return Ok(false);
    }
    Ok(folder_size(root)? >= limit_mb.saturating_mul(1024 * 1024))
}
