//! Broker metrics: relaxed atomic counters, safe to bump from any number of
//! delivery workers and read from any thread without synchronizing with the
//! writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    circuit_trips: AtomicU64,
    last_handler_latency_us: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_circuit_trips(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn observe_handler_latency(&self, latency: Duration) {
        self.last_handler_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Point-in-time view. `pending` and `dead_letter_size` come from the
    /// stores, which the broker reads alongside the counters.
    pub fn snapshot(&self, pending: usize, dead_letter_size: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            last_handler_latency_us: self.last_handler_latency_us.load(Ordering::Relaxed),
            pending,
            dead_letter_size,
        }
    }
}

/// Serializable snapshot of the broker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Delivery attempts (handler invocations), including retries.
    pub delivered: u64,
    /// Deliveries confirmed by `ack`.
    pub acknowledged: u64,
    /// Messages moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Backoff-and-retry cycles performed.
    pub retries: u64,
    /// Closed → Open circuit-breaker transitions.
    pub circuit_trips: u64,
    /// Most recent invocation-to-ack latency, in microseconds.
    pub last_handler_latency_us: u64,
    /// Approximate in-flight (unacknowledged) entries.
    pub pending: usize,
    /// Current dead-letter queue size.
    pub dead_letter_size: usize,
}
