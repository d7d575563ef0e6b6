//! Fetching image bytes.
//!
//! A [`Transport`] performs one bounded HTTP GET. [`classify_response`] maps
//! its raw result to a [`FetchOutcome`], and the [`FetchWorker`] drives
//! attempts through the domain throttle with retries.

#[cfg(feature = "network")]
pub mod transport;
pub mod worker;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::FailureClass;
use crate::hash::PerceptualHasher;

#[cfg(feature = "network")]
pub use transport::HttpTransport;
pub use worker::{FetchReport, FetchWorker, RetryPolicy};

/// Raw response handed back by a transport.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Parsed `Retry-After` header, if any.
    pub retry_after: Option<Duration>,
    /// Body bytes; only read for 2xx responses.
    pub body: Vec<u8>,
}

/// Transport-level failure before any status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Retrieves one URL within a timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration)
        -> Result<TransportResponse, TransportError>;
}

/// Why a fetch is terminal for its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardFailReason {
    /// Terminal HTTP status such as 404.
    HttpStatus(u16),
    /// 2xx with a content type that is not an image.
    NonImageContent(String),
    /// 2xx whose bytes are empty or not a recognisable image.
    MalformedBody,
    /// Transport failure that is not worth retrying.
    Network(String),
}

impl fmt::Display for HardFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus(status) => write!(f, "HTTP status {status}"),
            Self::NonImageContent(ct) => write!(f, "non-image content type {ct}"),
            Self::MalformedBody => f.write_str("malformed image body"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

/// Result of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    /// Retryable: 408, 5xx, timeout or connect error (`status` is `None`).
    SoftFail { status: Option<u16> },
    HardFail { reason: HardFailReason },
    /// 429, with the server's delay hint when present.
    RateLimited { retry_after: Option<Duration> },
    /// The domain's breaker turned the request away; nothing was sent.
    CircuitOpen,
    /// The domain has no request budget left this run; nothing was sent.
    BudgetExhausted,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether another attempt may change the result.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SoftFail { .. } | Self::RateLimited { .. })
    }

    /// Error taxonomy class of a non-successful outcome.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::Success { .. } | Self::CircuitOpen | Self::BudgetExhausted => None,
            Self::SoftFail { .. } | Self::RateLimited { .. } => Some(FailureClass::Transient),
            Self::HardFail { .. } => Some(FailureClass::Permanent),
        }
    }
}

/// Content types accepted without an `image/` prefix; the bytes decide.
const OPAQUE_CONTENT_TYPES: &[&str] = &["application/octet-stream", "binary/octet-stream"];

fn is_image_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("image/") || OPAQUE_CONTENT_TYPES.contains(&essence.as_str())
}

/// Map a transport result to a fetch outcome.
pub fn classify_response(result: Result<TransportResponse, TransportError>) -> FetchOutcome {
    let response = match result {
        Ok(response) => response,
        Err(TransportError::Timeout | TransportError::Connect(_)) => {
            return FetchOutcome::SoftFail { status: None };
        }
        Err(TransportError::Other(msg)) => {
            return FetchOutcome::HardFail {
                reason: HardFailReason::Network(msg),
            };
        }
    };

    match response.status {
        429 => FetchOutcome::RateLimited {
            retry_after: response.retry_after,
        },
        408 | 500..=599 => FetchOutcome::SoftFail {
            status: Some(response.status),
        },
        200..=299 => {
            if let Some(ct) = response.content_type.as_deref() {
                if !is_image_content_type(ct) {
                    return FetchOutcome::HardFail {
                        reason: HardFailReason::NonImageContent(ct.to_string()),
                    };
                }
            }
            if response.body.is_empty() || !PerceptualHasher::is_supported_format(&response.body) {
                return FetchOutcome::HardFail {
                    reason: HardFailReason::MalformedBody,
                };
            }
            FetchOutcome::Success {
                bytes: response.body,
                content_type: response.content_type,
            }
        }
        status => FetchOutcome::HardFail {
            reason: HardFailReason::HttpStatus(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn response(status: u16, content_type: Option<&str>, body: &[u8]) -> TransportResponse {
        TransportResponse {
            status,
            content_type: content_type.map(String::from),
            retry_after: None,
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_image_success() {
        let outcome = classify_response(Ok(response(200, Some("image/png"), PNG_MAGIC)));
        assert!(outcome.is_success());
        assert_eq!(outcome.failure_class(), None);
    }

    #[test]
    fn test_octet_stream_relies_on_magic() {
        let ok = classify_response(Ok(response(
            200,
            Some("application/octet-stream"),
            PNG_MAGIC,
        )));
        assert!(ok.is_success());

        let missing = classify_response(Ok(response(200, None, PNG_MAGIC)));
        assert!(missing.is_success());
    }

    #[test]
    fn test_non_image_content_is_hard_fail() {
        let outcome = classify_response(Ok(response(
            200,
            Some("text/html; charset=utf-8"),
            b"<html></html>",
        )));
        assert_eq!(
            outcome,
            FetchOutcome::HardFail {
                reason: HardFailReason::NonImageContent("text/html; charset=utf-8".into())
            }
        );
        assert!(!outcome.is_retryable());
        assert_eq!(outcome.failure_class(), Some(FailureClass::Permanent));
    }

    #[test]
    fn test_malformed_body() {
        let outcome = classify_response(Ok(response(200, Some("image/jpeg"), b"garbage")));
        assert_eq!(
            outcome,
            FetchOutcome::HardFail {
                reason: HardFailReason::MalformedBody
            }
        );
        let empty = classify_response(Ok(response(200, Some("image/jpeg"), b"")));
        assert!(matches!(empty, FetchOutcome::HardFail { .. }));
    }

    #[test]
    fn test_status_mapping() {
        let mut limited = response(429, None, b"");
        limited.retry_after = Some(Duration::from_secs(7));
        assert_eq!(
            classify_response(Ok(limited)),
            FetchOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        for status in [408, 500, 502, 503, 504] {
            let outcome = classify_response(Ok(response(status, None, b"")));
            assert_eq!(outcome, FetchOutcome::SoftFail { status: Some(status) });
            assert!(outcome.is_retryable());
        }
        for status in [301, 403, 404, 410] {
            assert_eq!(
                classify_response(Ok(response(status, None, b""))),
                FetchOutcome::HardFail {
                    reason: HardFailReason::HttpStatus(status)
                }
            );
        }
    }

    #[test]
    fn test_transport_errors() {
        assert_eq!(
            classify_response(Err(TransportError::Timeout)),
            FetchOutcome::SoftFail { status: None }
        );
        assert_eq!(
            classify_response(Err(TransportError::Connect("refused".into()))),
            FetchOutcome::SoftFail { status: None }
        );
        assert!(matches!(
            classify_response(Err(TransportError::Other("bad url".into()))),
            FetchOutcome::HardFail {
                reason: HardFailReason::Network(_)
            }
        ));
    }
}
