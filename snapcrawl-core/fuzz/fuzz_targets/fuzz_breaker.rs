#![no_main]

//! Fuzz target for the circuit breaker state machine
//!
//! Replays an arbitrary sequence of admissions, outcomes and clock jumps and
//! checks that at most one half-open trial is ever outstanding.
//!
//! Run with: cargo +nightly fuzz run fuzz_breaker

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use snapcrawl_core::config::BreakerConfig;
use snapcrawl_core::throttle::{Admission, BreakerState, CircuitBreaker};
use tokio::time::Instant;

fuzz_target!(|data: &[u8]| {
    let config = BreakerConfig {
        enabled: true,
        failure_threshold: 3,
        base_cooldown_secs: 10,
        backoff_multiplier: 2.0,
        max_cooldown_secs: 35,
    };
    let mut breaker = CircuitBreaker::new(&config);
    let mut now = Instant::now();
    let mut trial_out = false;

    for &op in data {
        match op % 5 {
            0 => match breaker.admit(now) {
                Admission::Trial => {
                    assert!(!trial_out, "second trial granted");
                    trial_out = true;
                }
                Admission::Allowed => assert_eq!(breaker.state(), BreakerState::Closed),
                Admission::Rejected { .. } => assert_ne!(breaker.state(), BreakerState::Closed),
            },
            1 => {
                breaker.on_success(trial_out);
                trial_out = false;
            }
            2 => {
                breaker.on_failure(trial_out, now);
                trial_out = false;
            }
            3 => {
                if trial_out {
                    breaker.abandon_trial();
                    trial_out = false;
                }
            }
            _ => now += Duration::from_secs(u64::from(op >> 3)),
        }
        assert!(breaker.cooldown() <= Duration::from_secs(35));
    }
});
