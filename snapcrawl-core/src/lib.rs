//! Snapcrawl Core - fetch-and-dedup pipeline for harvesting images
//!
//! Candidate URLs flow through a bounded fetch stage, quality gates and a
//! perceptual-hash similarity index before being persisted. Concurrency is
//! capped globally and per domain, and every domain sits behind its own
//! circuit breaker so one failing host cannot stall the rest.
//!
//! # Features
//!
//! - Global and per-domain permits with a per-domain circuit breaker
//! - Retries with jittered exponential backoff and `Retry-After` handling
//! - BK-tree near-duplicate detection over 64-bit Blockhash fingerprints
//! - Idempotent SQLite-backed persistence and an offline post-filter
//!   (`sqlite` feature)
//! - HTTP transport and seed-page extraction (`network` feature)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use snapcrawl_core::{list_source, CrawlConfig, Pipeline, SimilarityIndex, SqliteStore};
//!
//! # async fn example() -> snapcrawl_core::Result<()> {
//! let config = CrawlConfig::load(std::path::Path::new("config.yaml"))?;
//! let store = SqliteStore::open(
//!     &config.project.database_path,
//!     &config.project.storage_path,
//!     config.image.save_format,
//!     config.image.jpeg_quality,
//! )
//! .await?;
//! let index = SimilarityIndex::from_hashes(store.load_hashes().await?);
//!
//! let pipeline = Pipeline::builder(config.clone())
//!     .sink(Arc::new(store))
//!     .index(index)
//!     .build()?;
//! let summary = pipeline.run(list_source(config.download.sources)).await?;
//! println!("saved {} images", summary.stats.saved);
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod index;
pub mod pipeline;
#[cfg(feature = "sqlite")]
pub mod postfilter;
pub mod preprocess;
pub mod source;
pub mod store;
pub mod throttle;

// Re-export main types for convenience
pub use classify::{Classifier, HeuristicClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CrawlConfig;
pub use error::{CrawlError, FailureClass, Result};
pub use fetch::{FetchOutcome, Transport, TransportError, TransportResponse};
pub use hash::{PerceptualHash, PerceptualHasher, HASH_BITS};
pub use index::SimilarityIndex;
pub use pipeline::{
    DiscardReason, Pipeline, PipelineBuilder, RunSummary, StatsSnapshot, StopReason,
};
pub use preprocess::{
    decode_image, DecodedImage, ImagePreprocessor, Preprocessor, QualityRejection,
};
pub use source::{list_source, UrlSource};
pub use store::{
    exceeds_folder_limit, folder_size, PersistenceSink, SaveOutcome, SaveRequest, SavedRecord,
};
pub use throttle::{domain_of, DomainThrottle};

#[cfg(feature = "network")]
pub use fetch::HttpTransport;
#[cfg(feature = "network")]
pub use source::PageSource;

#[cfg(feature = "sqlite")]
pub use postfilter::{clean_dataset, CleanReport};
#[cfg(feature = "sqlite")]
pub use store::{BasicStats, SqliteStore, StoredImage};
