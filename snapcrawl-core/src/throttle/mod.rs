//! Domain throttle
//!
//! Gatekeeper for every network attempt. Each domain gets lazily created
//! state holding its circuit breaker, its next-allowed time and a permit set
//! sized to `per_domain_concurrency`; one global permit set bounds the total
//! number of fetches in flight. An optional per-domain request budget caps
//! how many attempts a domain receives in one run.
//!
//! The registry is an explicit object owned by one crawl run. All breaker
//! and counter mutations for a domain happen under that domain's lock, so
//! concurrent outcomes are applied one at a time.

pub mod breaker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BreakerConfig, DownloadConfig};

pub use breaker::{Admission, BreakerState, CircuitBreaker};

/// Why [`DomainThrottle::acquire`] did not hand out a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("request budget of {budget} exhausted")]
    BudgetExhausted { budget: u64 },

    #[error("acquire cancelled")]
    Cancelled,
}

/// How one attempt should be booked against the domain's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptReport {
    Success,
    Failure,
    /// Neither; a held trial is handed back.
    Neutral,
}

/// Point-in-time view of one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trips: u32,
    pub in_flight: usize,
    /// Permits handed out so far.
    pub requests: u64,
    pub cooldown: Duration,
    pub remaining_cooldown: Duration,
}

struct DomainInner {
    breaker: CircuitBreaker,
    next_allowed: Option<Instant>,
    in_flight: usize,
    requests: u64,
}

struct DomainState {
    permits: Arc<Semaphore>,
    inner: Mutex<DomainInner>,
}

/// Registry of per-domain state plus the global permit pool.
pub struct DomainThrottle {
    domains: DashMap<String, Arc<DomainState>>,
    global: Arc<Semaphore>,
    global_limit: usize,
    per_domain_limit: usize,
    request_budget: u64,
    breaker: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl DomainThrottle {
    pub fn new(download: &DownloadConfig, breaker: &BreakerConfig) -> Self {
        Self::with_clock(download, breaker, Arc::new(SystemClock))
    }

    pub fn with_clock(
        download: &DownloadConfig,
        breaker: &BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let global_limit = download.global_concurrency.max(1);
        Self {
            domains: DashMap::new(),
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
            per_domain_limit: download.per_domain_concurrency.max(1),
            request_budget: download.max_requests_per_site,
            breaker: breaker.clone(),
            clock,
        }
    }

    fn state(&self, domain: &str) -> Arc<DomainState> {
        if let Some(state) = self.domains.get(domain) {
            return Arc::clone(&state);
        }
        let state = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                debug!(domain = %domain, "Tracking new domain");
                Arc::new(DomainState {
                    permits: Arc::new(Semaphore::new(self.per_domain_limit)),
                    inner: Mutex::new(DomainInner {
                        breaker: CircuitBreaker::new(&self.breaker),
                        next_allowed: None,
                        in_flight: 0,
                        requests: 0,
                    }),
                })
            });
        Arc::clone(&state)
    }

    /// Wait until `domain` may be fetched and take a domain and a global permit.
    ///
    /// An open breaker or a spent request budget is reported immediately.
    /// Otherwise the call waits for
    /// the domain's next-allowed time, then the domain permit, then the global
    /// permit, returning [`ThrottleError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchPermit, ThrottleError> {
        let state = self.state(domain);

        {
            let inner = state.inner.lock();
            self.check_budget(&inner)?;
            if self.breaker.enabled {
                if let Some(retry_in) = inner.breaker.would_reject(self.clock.now()) {
                    return Err(ThrottleError::CircuitOpen { retry_in });
                }
            }
        }

        self.wait_next_allowed(&state, cancel).await?;

        let domain_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
            permit = Arc::clone(&state.permits).acquire_owned() => {
                permit.map_err(|_| ThrottleError::Cancelled)?
            }
        };
        let global_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
            permit = Arc::clone(&self.global).acquire_owned() => {
                permit.map_err(|_| ThrottleError::Cancelled)?
            }
        };

        // The breaker may have tripped while this request queued for permits.
        let trial = {
            let mut inner = state.inner.lock();
            self.check_budget(&inner)?;
            let trial = if self.breaker.enabled {
                match inner.breaker.admit(self.clock.now()) {
                    Admission::Allowed => false,
                    Admission::Trial => {
                        info!(domain = %domain, "Circuit half-open, sending trial request");
                        true
                    }
                    Admission::Rejected { retry_in } => {
                        return Err(ThrottleError::CircuitOpen { retry_in });
                    }
                }
            } else {
                false
            };
            inner.in_flight += 1;
            inner.requests += 1;
            trial
        };

        Ok(FetchPermit {
            domain: domain.to_string(),
            state,
            clock: Arc::clone(&self.clock),
            trial,
            resolved: false,
            _domain_permit: domain_permit,
            _global_permit: global_permit,
        })
    }

    fn check_budget(&self, inner: &DomainInner) -> Result<(), ThrottleError> {
        if self.request_budget > 0 && inner.requests >= self.request_budget {
            return Err(ThrottleError::BudgetExhausted {
                budget: self.request_budget,
            });
        }
        Ok(())
    }

    async fn wait_next_allowed(
        &self,
        state: &DomainState,
        cancel: &CancellationToken,
    ) -> Result<(), ThrottleError> {
        let mut waited_for: Option<Instant> = None;
        loop {
            let now = self.clock.now();
            let deadline = match state.inner.lock().next_allowed {
                Some(at) if at > now && Some(at) != waited_for => at,
                _ => return Ok(()),
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
                _ = tokio::time::sleep(deadline - now) => {}
            }
            waited_for = Some(deadline);
        }
    }

    /// Push the domain's next-allowed time at least `delay` into the future.
    pub fn delay_domain(&self, domain: &str, delay: Duration) {
        let state = self.state(domain);
        let until = self.clock.now() + delay;
        let mut inner = state.inner.lock();
        if inner.next_allowed.map_or(true, |current| current < until) {
            inner.next_allowed = Some(until);
            debug!(domain = %domain, delay_ms = delay.as_millis() as u64, "Domain delayed");
        }
    }

    pub fn snapshot(&self, domain: &str) -> Option<DomainSnapshot> {
        let state = self.domains.get(domain)?;
        let inner = state.inner.lock();
        Some(DomainSnapshot {
            state: inner.breaker.state(),
            consecutive_failures: inner.breaker.consecutive_failures(),
            trips: inner.breaker.trips(),
            in_flight: inner.in_flight,
            requests: inner.requests,
            cooldown: inner.breaker.cooldown(),
            remaining_cooldown: inner.breaker.remaining_cooldown(self.clock.now()),
        })
    }

    /// Domains whose breaker is currently not closed.
    pub fn open_domains(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .domains
            .iter()
            .filter(|entry| entry.value().inner.lock().breaker.state() != BreakerState::Closed)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Fetches currently holding a global permit.
    pub fn global_in_flight(&self) -> usize {
        self.global_limit - self.global.available_permits()
    }
}

/// Both permits for one attempt. Dropping it releases them.
pub struct FetchPermit {
    domain: String,
    state: Arc<DomainState>,
    clock: Arc<dyn Clock>,
    trial: bool,
    resolved: bool,
    _domain_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl FetchPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether this attempt is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Book the attempt's outcome against the breaker and release the permits.
    pub fn complete(mut self, report: AttemptReport) {
        let mut inner = self.state.inner.lock();
        match report {
            AttemptReport::Success => inner.breaker.on_success(self.trial),
            AttemptReport::Failure => {
                let now = self.clock.now();
                if inner.breaker.on_failure(self.trial, now) {
                    warn!(
                        domain = %self.domain,
                        failures = inner.breaker.consecutive_failures(),
                        cooldown_ms = inner.breaker.cooldown().as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            AttemptReport::Neutral => {
                if self.trial {
                    inner.breaker.abandon_trial();
                }
            }
        }
        if self.trial && inner.breaker.state() == BreakerState::Closed {
            info!(domain = %self.domain, "Circuit closed after successful trial");
        }
        drop(inner);
        self.resolved = true;
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if self.trial && !self.resolved {
            inner.breaker.abandon_trial();
        }
    }
}

/// Lowercased host of `url`, the key the throttle tracks.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(|host| host.to_ascii_lowercase())
}
