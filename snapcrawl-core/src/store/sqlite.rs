//! SQLite-backed [`PersistenceSink`].
//!
//! Files land in `<storage>/<YYYY-MM-DD>/<domain>/<phash>.<ext>`; one row per
//! image in `images`, unique on `phash`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, instrument, warn};

use super::{
    content_digest, domain_dir, encode_for_save, write_atomic, PersistenceSink, SaveOutcome,
    SaveRequest, SavedRecord,
};
use crate::config::SaveFormat;
use crate::error::{CrawlError, Result};
use crate::hash::PerceptualHash;

/// One row of the `images` table, as needed to re-examine the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub id: i64,
    pub path: PathBuf,
    pub hash: Option<PerceptualHash>,
}

/// Aggregate counts over the `images` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasicStats {
    pub images: u64,
    pub domains: u64,
    pub bytes: u64,
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    storage_root: PathBuf,
    save_format: SaveFormat,
    jpeg_quality: u8,
}

impl SqliteStore {
    /// Open (creating if needed) the database and make sure the schema exists.
    pub async fn open(
        db_path: &Path,
        storage_root: &Path,
        save_format: SaveFormat,
        jpeg_quality: u8,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            storage_root: storage_root.to_path_buf(),
            save_format,
            jpeg_quality,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                source TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                ext TEXT NOT NULL,
                saved_path TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                score REAL,
                phash TEXT NOT NULL UNIQUE,
                content_sha3 TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_source ON images(source)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub async fn contains(&self, hash: PerceptualHash) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM images WHERE phash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Every stored hash, for rebuilding the similarity index at startup.
    pub async fn load_hashes(&self) -> Result<Vec<PerceptualHash>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT phash FROM images ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|hex| match PerceptualHash::from_hex(hex) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!(phash = %hex, error = %e, "Skipping malformed stored hash");
                    None
                }
            })
            .collect())
    }

    pub async fn basic_stats(&self) -> Result<BasicStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS images,
                    COUNT(DISTINCT source) AS domains,
                    COALESCE(SUM(bytes), 0) AS bytes
             FROM images",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(BasicStats {
            images: row.get::<i64, _>("images") as u64,
            domains: row.get::<i64, _>("domains") as u64,
            bytes: row.get::<i64, _>("bytes") as u64,
        })
    }

    /// Image count per source domain, largest first.
    pub async fn stats_by_domain(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS cnt FROM images
             GROUP BY source ORDER BY cnt DESC, source ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("source"), row.get::<i64, _>("cnt") as u64))
            .collect())
    }

    /// Image count per UTC day (`YYYY-MM-DD`), most recent first.
    pub async fn stats_by_date(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*) AS cnt FROM images
             GROUP BY day ORDER BY day DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("day"), row.get::<i64, _>("cnt") as u64))
            .collect())
    }

    /// Stored images in insertion order; `limit == 0` lists all of them.
    pub async fn list_images(&self, limit: usize) -> Result<Vec<StoredImage>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let rows = sqlx::query("SELECT id, saved_path, phash FROM images ORDER BY id LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let phash: String = row.get("phash");
                StoredImage {
                    id: row.get("id"),
                    path: PathBuf::from(row.get::<String, _>("saved_path")),
                    hash: PerceptualHash::from_hex(&phash).ok(),
                }
            })
            .collect())
    }

    /// Drop the record for `id`. Returns whether a row was removed.
    pub async fn delete_image(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PersistenceSink for SqliteStore {
    #[instrument(skip_all, fields(url = %request.url, phash = %request.hash))]
    async fn persist(&self, request: SaveRequest) -> Result<SaveOutcome> {
        if self.contains(request.hash).await? {
            debug!("Hash already stored");
            return Ok(SaveOutcome::AlreadyStored);
        }

        let save_format = self.save_format;
        let quality = self.jpeg_quality;
        let (request, encoded) = tokio::task::spawn_blocking(move || {
            let encoded = encode_for_save(&request, save_format, quality);
            (request, encoded)
        })
        .await
        .map_err(|e| CrawlError::Persistence(format!("Encoder task failed: {e}")))?;
        let (bytes, ext) = encoded?;

        let now = Utc::now();
        let path = self
            .storage_root
            .join(now.format("%Y-%m-%d").to_string())
            .join(domain_dir(&request.domain))
            .join(format!("{}.{ext}", request.hash.to_hex()));

        let digest = content_digest(&bytes);
        let (width, height) = (request.image.width(), request.image.height());

        // The row goes in first so a conflicting hash never touches the disk.
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO images
                (url, source, width, height, ext, saved_path, bytes, score, phash, content_sha3, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(phash) DO NOTHING",
        )
        .bind(&request.url)
        .bind(&request.domain)
        .bind(i64::from(width))
        .bind(i64::from(height))
        .bind(&ext)
        .bind(path.to_string_lossy().into_owned())
        .bind(bytes.len() as i64)
        .bind(request.score.map(f64::from))
        .bind(request.hash.to_hex())
        .bind(&digest)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            CrawlError::Persistence(format!("Failed to record {}: {e}", path.display()))
        })?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Hash stored concurrently, nothing written");
            return Ok(SaveOutcome::AlreadyStored);
        }

        if let Err(e) = write_atomic(&path, &bytes).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        if let Err(e) = tx.commit().await {
            // No row means no image: take the file back out.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CrawlError::Persistence(format!(
                "Failed to record {}: {e}",
                path.display()
            )));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Image stored");
        Ok(SaveOutcome::Stored(SavedRecord {
            id: inserted.last_insert_rowid(),
            hash: request.hash,
            url: request.url,
            domain: request.domain,
            path,
            ext,
            width,
            height,
            bytes: bytes.len() as u64,
            score: request.score,
            content_sha3: digest,
        }))
    }

    async fn stored_count(&self) -> Result<u64> {
        Ok(self.basic_stats().await?.images)
    }
}
