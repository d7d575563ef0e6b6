//! Crawl configuration
//!
//! Loaded from a YAML file with per-field defaults, then overlaid with
//! `SNAPCRAWL_*` environment variables and validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, Result};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Top-level configuration for one crawl run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub project: ProjectConfig,
    pub download: DownloadConfig,
    pub breaker: BreakerConfig,
    pub image: ImageConfig,
    pub classifier: ClassifierConfig,
    pub deduplication: DedupConfig,
    pub pipeline: PipelineConfig,
    pub packing: PackingConfig,
    pub postfilter: PostfilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root folder for saved images (default: ./dataset)
    pub storage_path: PathBuf,
    /// SQLite database holding records and hashes (default: ./snapcrawl.sqlite3)
    pub database_path: PathBuf,
    /// Stop once the store holds this many images; 0 = unbounded
    pub target_saved_count: u64,
    /// Storage size that triggers a pack hint after a run; 0 = never (default: 1024)
    pub max_folder_size_mb: u64,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./dataset"),
            database_path: PathBuf::from("./snapcrawl.sqlite3"),
            target_saved_count: 0,
            max_folder_size_mb: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Total in-flight fetches (default: 4)
    pub global_concurrency: usize,
    /// In-flight fetches per domain (default: 2)
    pub per_domain_concurrency: usize,
    /// In-flight pipeline items; 0 = twice the global concurrency
    pub max_pending_items: usize,
    pub fetch_timeout_secs: u64,
    /// Retries after the first attempt, for soft failures only (default: 3)
    pub fetch_max_retries: u32,
    pub retry_initial_interval_ms: u64,
    pub retry_max_interval_ms: u64,
    /// Delay applied to a domain after a 429 without a Retry-After hint
    pub rate_limit_delay_secs: u64,
    /// Base pause before each request, jittered to 50-150% (default: 1000)
    pub request_delay_ms: u64,
    /// Network requests allowed per domain in one run; 0 = unbounded
    pub max_requests_per_site: u64,
    pub user_agents: Vec<String>,
    /// Seed pages or direct image URLs
    pub sources: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 4,
            per_domain_concurrency: 2,
            max_pending_items: 0,
            fetch_timeout_secs: 25,
            fetch_max_retries: 3,
            retry_initial_interval_ms: 500,
            retry_max_interval_ms: 8_000,
            rate_limit_delay_secs: 5,
            request_delay_ms: 1_000,
            max_requests_per_site: 0,
            user_agents: vec![DEFAULT_USER_AGENT.to_string()],
            sources: Vec::new(),
        }
    }
}

impl DownloadConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delay_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Effective cap on concurrently processed pipeline items.
    pub fn pending_capacity(&self) -> usize {
        if self.max_pending_items == 0 {
            self.global_concurrency.saturating_mul(2)
        } else {
            self.max_pending_items
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open a domain's breaker (default: 3)
    pub failure_threshold: u32,
    pub base_cooldown_secs: u64,
    /// Cooldown growth per successive trip (default: 2.0)
    pub backoff_multiplier: f64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            base_cooldown_secs: 60,
            backoff_multiplier: 2.0,
            max_cooldown_secs: 900,
        }
    }
}

impl BreakerConfig {
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// Accepted image orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    All,
    Square,
    #[serde(alias = "vertical")]
    Portrait,
    #[serde(alias = "horizontal")]
    Landscape,
}

/// How accepted images are written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Re-encode as JPEG at `jpeg_quality`.
    #[default]
    Jpeg,
    /// Keep the downloaded bytes.
    Original,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkFilterConfig {
    pub enable: bool,
    /// Fraction of the height scanned at the top and bottom
    pub band_ratio: f32,
    /// Neighbouring-pixel luma difference counted as an edge
    pub edge_threshold: u8,
    /// Edge density at or above which a band is treated as watermarked
    pub edge_density: f32,
}

impl Default for WatermarkFilterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            band_ratio: 0.15,
            edge_threshold: 25,
            edge_density: 0.08,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Minimum length of the shorter side in pixels (default: 512)
    pub min_side: u32,
    pub accept_bw: bool,
    pub orientation: Orientation,
    pub save_format: SaveFormat,
    pub jpeg_quality: u8,
    /// Accepted URL extensions for candidates found on pages; empty = any
    pub extensions: Vec<String>,
    pub skip_watermarked_urls: bool,
    pub watermark_keywords: Vec<String>,
    pub watermark_filter: WatermarkFilterConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_side: 512,
            accept_bw: false,
            orientation: Orientation::All,
            save_format: SaveFormat::Jpeg,
            jpeg_quality: 95,
            extensions: vec![".jpg".into(), ".jpeg".into(), ".png".into()],
            skip_watermarked_urls: true,
            watermark_keywords: ["watermark", "wm", "overlay", "preview", "thumb"]
                .into_iter()
                .map(String::from)
                .collect(),
            watermark_filter: WatermarkFilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enable: bool,
    /// Minimum photo score in [0, 1] (default: 0.5)
    pub threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enable: false,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enable: bool,
    /// Maximum Hamming distance treated as a near duplicate (default: 5)
    pub hamming_threshold: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enable: true,
            hamming_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval between aggregate progress logs (default: 10)
    pub stats_interval_secs: u64,
    /// Time in-flight items get to finish after a stop (default: 5)
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl PipelineConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Archive container used by `pack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackFormat {
    #[default]
    Zip,
    Tar,
}

impl PackFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    pub format: PackFormat,
    /// Suggest packing when storage outgrows `project.max_folder_size_mb`
    pub auto_pack: bool,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            format: PackFormat::Zip,
            auto_pack: true,
        }
    }
}

/// Offline pass that removes stored images scoring below a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostfilterConfig {
    pub enable: bool,
    /// Minimum photo score to keep an image (default: 0.6)
    pub threshold: f32,
    /// Only report what would be removed (default: true)
    pub dry_run: bool,
    /// Images examined per pass; 0 = all
    pub scan_limit: usize,
}

impl Default for PostfilterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            threshold: 0.6,
            dry_run: true,
            scan_limit: 0,
        }
    }
}

impl CrawlConfig {
    /// Load a YAML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without env overrides or validation.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overlay values from `SNAPCRAWL_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SNAPCRAWL_STORAGE_PATH") {
            self.project.storage_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("SNAPCRAWL_DATABASE_PATH") {
            self.project.database_path = PathBuf::from(path);
        }
        if let Some(target) = lookup("SNAPCRAWL_TARGET").and_then(|v| v.parse().ok()) {
            self.project.target_saved_count = target;
        }
        if let Some(n) = lookup("SNAPCRAWL_GLOBAL_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.download.global_concurrency = n;
        }
        if let Some(n) = lookup("SNAPCRAWL_PER_DOMAIN_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.download.per_domain_concurrency = n;
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(CrawlError::Config(msg.to_string()))
        }

        if self.download.global_concurrency == 0 {
            return invalid("download.global_concurrency must be >= 1");
        }
        if self.download.per_domain_concurrency == 0 {
            return invalid("download.per_domain_concurrency must be >= 1");
        }
        if self.download.fetch_timeout_secs == 0 {
            return invalid("download.fetch_timeout_secs must be >= 1");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be >= 1");
        }
        let multiplier = self.breaker.backoff_multiplier;
        if multiplier.is_nan() || multiplier <= 1.0 {
            return invalid("breaker.backoff_multiplier must be > 1");
        }
        if self.breaker.max_cooldown_secs < self.breaker.base_cooldown_secs {
            return invalid("breaker.max_cooldown_secs must be >= base_cooldown_secs");
        }
        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return invalid("classifier.threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.postfilter.threshold) {
            return invalid("postfilter.threshold must be within [0, 1]");
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            return invalid("image.jpeg_quality must be within 1..=100");
        }
        let band = self.image.watermark_filter.band_ratio;
        if !(band > 0.0 && band <= 0.5) {
            return invalid("image.watermark_filter.band_ratio must be within (0, 0.5]");
        }
        Ok(())
    }
}
