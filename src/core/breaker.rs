//! Per-subscription circuit breaker.
//!
//! Two states, Closed and Open; half-open is implicit. The breaker stamps an
//! `open_until` deadline when it trips and transitions back to Closed lazily
//! on the first check after the cooldown elapses. No timer is scheduled per
//! trip, so trips arriving faster than the cooldown cannot leak anything.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::message::current_timestamp;

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failures: AtomicU32,
    /// Unix-ms deadline while open; 0 means closed.
    open_until: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            failures: AtomicU32::new(0),
            open_until: AtomicU64::new(0),
        }
    }

    /// Counts one attributable failure. Returns true when this failure trips
    /// the breaker Closed → Open.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.failures.store(0, Ordering::Release);
            let until = current_timestamp() + self.cooldown.as_millis() as u64;
            self.open_until.store(until, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Resets the failure counter after an acknowledged delivery.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Whether delivery is currently suppressed. Transitions Open → Closed
    /// once the cooldown deadline has passed.
    pub fn is_open(&self) -> bool {
        let until = self.open_until.load(Ordering::Acquire);
        if until == 0 {
            return false;
        }
        if current_timestamp() >= until {
            // Only one caller wins the reset; losers observe closed either way.
            let _ = self.open_until.compare_exchange(
                until,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            false
        } else {
            true
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}
