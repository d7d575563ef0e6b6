//! Offline pass over stored images.
//!
//! Re-scores every stored file with a [`Classifier`] and removes the ones
//! below `postfilter.threshold`, both the file and its record. Unreadable
//! files score zero; records whose file is gone are skipped.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::classify::Classifier;
use crate::config::PostfilterConfig;
use crate::error::Result;
use crate::preprocess::decode_image;
use crate::store::SqliteStore;

/// Score used when the classifier cannot judge a decodable image.
const NEUTRAL_SCORE: f32 = 0.5;

/// Counts from one [`clean_dataset`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub scanned: u64,
    /// Images scoring below the threshold.
    pub flagged: u64,
    pub removed: u64,
    pub dry_run: bool,
}

/// Score stored images and drop those under the threshold.
///
/// Does nothing when `config.enable` is off. In dry-run mode flagged images
/// are only logged.
#[instrument(skip_all, fields(threshold = config.threshold, dry_run = config.dry_run))]
pub async fn clean_dataset(
    store: &SqliteStore,
    classifier: Arc<dyn Classifier>,
    config: &PostfilterConfig,
) -> Result<CleanReport> {
    let mut report = CleanReport {
        dry_run: config.dry_run,
        ..CleanReport::default()
    };
    if !config.enable {
        info!("Post-filter disabled (postfilter.enable = false)");
        return Ok(report);
    }

    for image in store.list_images(config.scan_limit).await? {
        let bytes = match tokio::fs::read(&image.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %image.path.display(), "Stored file missing, skipping");
                continue;
            }
            Err(e) => {
                debug!(path = %image.path.display(), error = %e, "Unreadable stored file");
                Vec::new()
            }
        };

        let classifier = Arc::clone(&classifier);
        let score = tokio::task::spawn_blocking(move || match decode_image(&bytes) {
            Ok(decoded) => classifier.score(&decoded).unwrap_or(NEUTRAL_SCORE),
            Err(_) => 0.0,
        })
        .await
        .unwrap_or(0.0);

        report.scanned += 1;
        if score >= config.threshold {
            continue;
        }
        report.flagged += 1;

        if config.dry_run {
            info!(path = %image.path.display(), score, "Would remove non-photo");
            continue;
        }
        info!(path = %image.path.display(), score, "Removing non-photo");
        if let Err(e) = tokio::fs::remove_file(&image.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %image.path.display(), error = %e, "Failed to delete file");
            }
        }
        if store.delete_image(image.id).await? {
            report.removed += 1;
        }
    }

    info!(
        scanned = report.scanned,
        flagged = report.flagged,
        removed = report.removed,
        "Post-filter finished"
    );
    Ok(report)
}
