//! reqwest-backed [`Transport`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::Client;
use tracing::debug;

use super::{Transport, TransportError, TransportResponse};
use crate::config::DownloadConfig;
use crate::error::{CrawlError, Result};

/// HTTP client that rotates through the configured User-Agent strings.
pub struct HttpTransport {
    client: Client,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.fetch_timeout())
            .pool_max_idle_per_host(config.per_domain_concurrency.max(1))
            .build()
            .map_err(|e| CrawlError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            user_agents: config.user_agents.clone(),
            next_agent: AtomicUsize::new(0),
        })
    }

    fn user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let slot = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(&self.user_agents[slot])
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let start = Instant::now();

        let mut request = self.client.get(url).timeout(timeout);
        if let Some(agent) = self.user_agent() {
            request = request.header(USER_AGENT, agent);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let body = if status.is_success() {
            response
                .bytes()
                .await
                .map_err(map_reqwest_error)?
                .to_vec()
        } else {
            Vec::new()
        };

        debug!(
            status = status.as_u16(),
            bytes = body.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Received HTTP response"
        );

        Ok(TransportResponse {
            status: status.as_u16(),
            content_type,
            retry_after,
            body,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

/// Parse a `Retry-After` value given as delay-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
