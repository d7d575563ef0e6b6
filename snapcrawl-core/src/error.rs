use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Invalid perceptual hash: {0}")]
    InvalidHash(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Pipeline shut down: {0}")]
    Shutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[cfg(feature = "network")]
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CrawlError>;

/// How a per-item failure is treated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Timeouts, 5xx, 429: retried, then a breaker failure if retries run out.
    Transient,
    /// 4xx other than 429, non-image content, malformed bytes: never retried.
    Permanent,
    /// Failed preprocessing or the classifier threshold.
    QualityRejection,
    /// Exact or near duplicate of an image already kept.
    DuplicateRejection,
}

impl FailureClass {
    /// Whether this class of failure feeds the domain's circuit breaker.
    pub fn counts_against_breaker(self) -> bool {
        matches!(self, Self::Transient | Self::Permanent)
    }
}
