//! Fetch worker: one URL through the throttle, with retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{classify_response, FetchOutcome, Transport, TransportError};
use crate::config::DownloadConfig;
use crate::error::{CrawlError, Result};
use crate::throttle::{AttemptReport, DomainThrottle, ThrottleError};

/// Attempt bounds and retry delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on a single attempt.
    pub timeout: Duration,
    /// Retries after the first attempt, for soft failures and rate limits only.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Domain delay after a 429 without a usable `Retry-After`.
    pub rate_limit_delay: Duration,
    /// Base pause before each attempt; see [`jittered`].
    pub request_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            max_retries: config.fetch_max_retries,
            initial_interval: config.retry_initial_interval(),
            max_interval: config.retry_max_interval(),
            rate_limit_delay: config.rate_limit_delay(),
            request_delay: config.request_delay(),
        }
    }

    fn build_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// A uniformly drawn delay between half and one and a half times `base`.
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    base.mul_f64(rand::rng().random_range(0.5..=1.5))
}

/// Final outcome for a URL plus the number of network attempts made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub attempts: u32,
}

pub struct FetchWorker {
    transport: Arc<dyn Transport>,
    throttle: Arc<DomainThrottle>,
    policy: RetryPolicy,
}

impl FetchWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        throttle: Arc<DomainThrottle>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            throttle,
            policy,
        }
    }

    pub fn throttle(&self) -> &Arc<DomainThrottle> {
        &self.throttle
    }

    /// Fetch `url`, retrying soft failures with jittered exponential delays.
    ///
    /// Permits are taken per attempt and released before any retry sleep.
    /// Each attempt waits a jittered `request_delay` while holding its
    /// permits, spacing requests to the same domain. Returns [`CrawlError::Shutdown`] if `cancel` fires at any suspension
    /// point.
    #[instrument(skip_all, fields(url = %url, domain = %domain))]
    pub async fn fetch(
        &self,
        url: &str,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let mut backoff = self.policy.build_backoff();
        let mut attempts = 0u32;

        loop {
            let permit = match self.throttle.acquire(domain, cancel).await {
                Ok(permit) => permit,
                Err(ThrottleError::CircuitOpen { retry_in }) => {
                    debug!(
                        retry_in_ms = retry_in.as_millis() as u64,
                        "Circuit open, skipping"
                    );
                    return Ok(FetchReport {
                        outcome: FetchOutcome::CircuitOpen,
                        attempts,
                    });
                }
                Err(ThrottleError::BudgetExhausted { budget }) => {
                    debug!(budget, "Domain request budget exhausted, skipping");
                    return Ok(FetchReport {
                        outcome: FetchOutcome::BudgetExhausted,
                        attempts,
                    });
                }
                Err(ThrottleError::Cancelled) => {
                    return Err(CrawlError::Shutdown("fetch cancelled".into()));
                }
            };

            let pause = jittered(self.policy.request_delay);
            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        permit.complete(AttemptReport::Neutral);
                        return Err(CrawlError::Shutdown("fetch cancelled".into()));
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            attempts += 1;
            let start = Instant::now();
            let request = tokio::time::timeout(
                self.policy.timeout,
                self.transport.get(url, self.policy.timeout),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = request => Some(result.unwrap_or(Err(TransportError::Timeout))),
            };
            let Some(result) = result else {
                permit.complete(AttemptReport::Neutral);
                return Err(CrawlError::Shutdown("fetch cancelled".into()));
            };

            let outcome = classify_response(result);
            let final_attempt = attempts > self.policy.max_retries;
            let latency_ms = start.elapsed().as_millis() as u64;

            let report = match &outcome {
                FetchOutcome::Success { .. } => AttemptReport::Success,
                FetchOutcome::HardFail { reason } => {
                    warn!(%reason, attempt = attempts, latency_ms, "Permanent fetch failure");
                    AttemptReport::Failure
                }
                FetchOutcome::RateLimited { retry_after } => {
                    let delay = retry_after.unwrap_or(self.policy.rate_limit_delay);
                    self.throttle.delay_domain(domain, delay);
                    warn!(
                        attempt = attempts,
                        retry_after_ms = delay.as_millis() as u64,
                        "Rate limited"
                    );
                    AttemptReport::Failure
                }
                FetchOutcome::SoftFail { status } => {
                    debug!(?status, attempt = attempts, latency_ms, "Transient fetch failure");
                    if final_attempt || permit.is_trial() {
                        AttemptReport::Failure
                    } else {
                        AttemptReport::Neutral
                    }
                }
                FetchOutcome::CircuitOpen | FetchOutcome::BudgetExhausted => AttemptReport::Neutral,
            };
            permit.complete(report);

            if final_attempt || !outcome.is_retryable() {
                if outcome.is_success() {
                    debug!(attempt = attempts, latency_ms, "Fetched");
                }
                return Ok(FetchReport { outcome, attempts });
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_interval);
            debug!(
                attempt = attempts,
                retry_after_ms = delay.as_millis() as u64,
                "Retry scheduled"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CrawlError::Shutdown("fetch cancelled".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::fetch::{HardFailReason, TransportResponse};
    use crate::throttle::BreakerState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    type Scripted = std::result::Result<TransportResponse, TransportError>;

    /// Replays canned responses; repeats the last one when the script runs out.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicU32,
        hang: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                hang: true,
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, _url: &str, _timeout: Duration) -> Scripted {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or(Err(TransportError::Timeout))
            } else {
                script.front().cloned().unwrap_or(Err(TransportError::Timeout))
            }
        }
    }

    fn status(code: u16) -> Scripted {
        Ok(TransportResponse {
            status: code,
            ..TransportResponse::default()
        })
    }

    fn image() -> Scripted {
        Ok(TransportResponse {
            status: 200,
            content_type: Some("image/png".into()),
            retry_after: None,
            body: PNG_MAGIC.to_vec(),
        })
    }

    fn worker(transport: Arc<ScriptedTransport>, max_retries: u32) -> FetchWorker {
        let download = DownloadConfig {
            fetch_max_retries: max_retries,
            retry_initial_interval_ms: 100,
            retry_max_interval_ms: 1_000,
            rate_limit_delay_secs: 5,
            request_delay_ms: 0,
            ..DownloadConfig::default()
        };
        let breaker = BreakerConfig {
            failure_threshold: 3,
            ..BreakerConfig::default()
        };
        let throttle = Arc::new(DomainThrottle::new(&download, &breaker));
        FetchWorker::new(transport, throttle, RetryPolicy::from_config(&download))
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_fail_then_success() {
        let transport = ScriptedTransport::new(vec![status(503), status(502), image()]);
        let worker = worker(transport.clone(), 3);
        let cancel = CancellationToken::new();

        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(report.attempts, 3);

        let snapshot = worker.throttle().snapshot("x").unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_fail_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(404)]);
        let worker = worker(transport.clone(), 3);
        let cancel = CancellationToken::new();

        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert_eq!(
            report.outcome,
            FetchOutcome::HardFail {
                reason: HardFailReason::HttpStatus(404)
            }
        );
        assert_eq!(report.attempts, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            worker.throttle().snapshot("x").unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_soft_fail_counts_once() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout)]);
        let worker = worker(transport.clone(), 2);
        let cancel = CancellationToken::new();

        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert_eq!(report.outcome, FetchOutcome::SoftFail { status: None });
        assert_eq!(report.attempts, 3);
        assert_eq!(
            worker.throttle().snapshot("x").unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays_domain() {
        let limited = Ok(TransportResponse {
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
            ..TransportResponse::default()
        });
        let transport = ScriptedTransport::new(vec![limited, image()]);
        let worker = worker(transport.clone(), 1);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(report.attempts, 2);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_network() {
        let transport = ScriptedTransport::new(vec![status(404)]);
        let worker = worker(transport.clone(), 0);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        }
        assert_eq!(
            worker.throttle().snapshot("x").unwrap().state,
            BreakerState::Open
        );

        let report = worker.fetch("http://x/b.png", "x", &cancel).await.unwrap();
        assert_eq!(report.outcome, FetchOutcome::CircuitOpen);
        assert_eq!(report.attempts, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
        let base = Duration::from_millis(1_000);
        for _ in 0..200 {
            let pause = jittered(base);
            assert!(pause >= Duration::from_millis(500), "{pause:?}");
            assert!(pause <= Duration::from_millis(1_500), "{pause:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_delay_spaces_attempts() {
        let transport = ScriptedTransport::new(vec![status(503), image()]);
        let mut worker = worker(transport.clone(), 1);
        worker.policy.request_delay = Duration::from_secs(2);
        worker.policy.initial_interval = Duration::from_millis(1);
        worker.policy.max_interval = Duration::from_millis(1);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert!(report.outcome.is_success());
        // Two attempts, each preceded by at least half the base delay.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() <= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_sends_nothing() {
        let transport = ScriptedTransport::new(vec![image()]);
        let download = DownloadConfig {
            request_delay_ms: 0,
            max_requests_per_site: 1,
            ..DownloadConfig::default()
        };
        let throttle = Arc::new(DomainThrottle::new(&download, &BreakerConfig::default()));
        let worker = FetchWorker::new(
            transport.clone(),
            throttle,
            RetryPolicy::from_config(&download),
        );
        let cancel = CancellationToken::new();

        let first = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert!(first.outcome.is_success());
        let second = worker.fetch("http://x/b.png", "x", &cancel).await.unwrap();
        assert_eq!(second.outcome, FetchOutcome::BudgetExhausted);
        assert_eq!(second.attempts, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_attempt() {
        let transport = ScriptedTransport::hanging();
        let worker = worker(transport.clone(), 0);
        let cancel = CancellationToken::new();

        let report = worker.fetch("http://x/a.png", "x", &cancel).await.unwrap();
        assert_eq!(report.outcome, FetchOutcome::SoftFail { status: None });
        assert_eq!(worker.throttle().global_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_permits() {
        let transport = ScriptedTransport::hanging();
        let worker = Arc::new(worker(transport.clone(), 0));
        let cancel = CancellationToken::new();

        let task = {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.fetch("http://x/a.png", "x", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.throttle().global_in_flight(), 1);

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(CrawlError::Shutdown(_))));
        assert_eq!(worker.throttle().global_in_flight(), 0);
        assert_eq!(worker.throttle().snapshot("x").unwrap().in_flight, 0);
    }
}
