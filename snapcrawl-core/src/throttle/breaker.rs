//! Per-domain circuit breaker state machine.
//!
//! Pure bookkeeping: every transition takes the current instant from the
//! caller, which owns the lock and the clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Answer to a request for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker, request proceeds.
    Allowed,
    /// The single half-open trial. Its outcome decides the next state.
    Trial,
    /// Open, or half-open with the trial already out.
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    base_cooldown: Duration,
    multiplier: f64,
    max_cooldown: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    trips: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown: config.base_cooldown(),
            multiplier: config.backoff_multiplier,
            max_cooldown: config.max_cooldown(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            trips: 0,
            open_until: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Times the breaker has opened since it was last closed by a successful trial.
    pub fn trips(&self) -> u32 {
        self.trips
    }

    /// Cooldown applied by the most recent trip; zero while never tripped.
    pub fn cooldown(&self) -> Duration {
        if self.trips == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(self.trips - 1).unwrap_or(i32::MAX);
        let secs = self.base_cooldown.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_cooldown.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_cooldown)
    }

    /// Time left before an open breaker lets a trial through.
    pub fn remaining_cooldown(&self, now: Instant) -> Duration {
        match (self.state, self.open_until) {
            (BreakerState::Open, Some(until)) => until.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    /// Whether a request arriving now would be turned away. Does not change state.
    pub fn would_reject(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Closed => None,
            BreakerState::Open => {
                let left = self.remaining_cooldown(now);
                (!left.is_zero()).then_some(left)
            }
            BreakerState::HalfOpen => self.trial_in_flight.then_some(Duration::ZERO),
        }
    }

    /// Decide whether a request may go out, granting at most one half-open trial.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let left = self.remaining_cooldown(now);
                if !left.is_zero() {
                    return Admission::Rejected { retry_in: left };
                }
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = true;
                Admission::Trial
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful fetch. Only the trial may close a half-open breaker.
    pub fn on_success(&mut self, trial: bool) {
        match self.state {
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen if trial => {
                self.state = BreakerState::Closed;
                self.consecutive_failures = 0;
                self.trips = 0;
                self.open_until = None;
                self.trial_in_flight = false;
            }
            // Stragglers admitted before the trip do not decide anything.
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    /// Record a failed fetch. Returns true when this failure opened the breaker.
    pub fn on_failure(&mut self, trial: bool, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip(now);
                    return true;
                }
                false
            }
            BreakerState::HalfOpen if trial => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.trip(now);
                true
            }
            BreakerState::HalfOpen | BreakerState::Open => false,
        }
    }

    /// Give back an unresolved trial so another request may try.
    pub fn abandon_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn trip(&mut self, now: Instant) {
        self.trips = self.trips.saturating_add(1);
        self.state = BreakerState::Open;
        self.trial_in_flight = false;
        self.open_until = Some(now + self.cooldown());
    }
}
