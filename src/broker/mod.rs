//! Broker facade: subscription lifecycle, publish fan-out, acknowledgment
//! routing, and shutdown orchestration.
//!
//! The registry is a concurrent map read by every publish and mutated only
//! by subscribe/unsubscribe. The publish path never suspends: every step on
//! it (registry scan, pending insert, buffer enqueue) is non-blocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::core::breaker::CircuitBreaker;
use crate::core::dlq::{DeadLetterEntry, DeadLetterStore, InMemoryDeadLetterStore};
use crate::core::error::BrokerError;
use crate::core::message::Message;
use crate::core::pending::{InMemoryPendingStore, PendingKey, PendingStore};
use crate::core::subscription::{
    spawn_ack_listener, spawn_worker, DeliveryPolicy, Handler, SubscribeOptions, Subscription,
    SubscriptionId, WorkerContext,
};
use crate::core::topics;
use crate::metrics::{BrokerMetrics, MetricsSnapshot};

/// Counts reported by [`Broker::close`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Entries still awaiting acknowledgment when the drain ended.
    pub pending: usize,
    /// Total dead-letter entries at shutdown.
    pub dead_lettered: usize,
    /// True when the grace period elapsed before every worker stopped.
    /// Messages may remain unacknowledged in that case.
    pub timed_out: bool,
}

/// In-process publish/subscribe broker.
///
/// Each subscription gets a bounded buffer, one ordered delivery worker,
/// at-least-once delivery through ack/retry with exponential backoff, a
/// circuit breaker, and a dead-letter queue for messages that exhaust their
/// retry budget. Publish never blocks on a slow subscriber.
pub struct Broker {
    config: Config,
    registry: DashMap<SubscriptionId, Arc<Subscription>>,
    pending: Arc<dyn PendingStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<BrokerMetrics>,
    next_subscription_id: AtomicU64,
    closed: AtomicBool,
}

impl Broker {
    /// Creates a broker backed by the in-memory stores.
    pub fn new(config: Config) -> Self {
        let dlq_capacity = config.dlq.max_entries;
        Self::with_stores(
            config,
            Arc::new(InMemoryPendingStore::new()),
            Arc::new(InMemoryDeadLetterStore::new(dlq_capacity)),
        )
    }

    /// Creates a broker over caller-supplied stores. This is the durability
    /// hook: any backend honoring the [`PendingStore`] / [`DeadLetterStore`]
    /// contracts can stand in for the in-memory ones.
    pub fn with_stores(
        config: Config,
        pending: Arc<dyn PendingStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            config,
            registry: DashMap::new(),
            pending,
            dead_letters,
            metrics: Arc::new(BrokerMetrics::new()),
            next_subscription_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a handler for every topic matching `pattern` and starts its
    /// delivery worker and ack listener. Must be called from within a Tokio
    /// runtime.
    pub fn subscribe<F>(
        &self,
        pattern: &str,
        handler: F,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionId, BrokerError>
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if pattern.trim().is_empty() {
            return Err(BrokerError::Validation(
                "subscription pattern must not be empty".into(),
            ));
        }
        let capacity = opts
            .buffer_capacity
            .unwrap_or(self.config.subscriptions.buffer_capacity);
        if capacity == 0 {
            return Err(BrokerError::Validation(
                "subscription buffer capacity must be non-zero".into(),
            ));
        }

        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (buffer_tx, buffer_rx) = flume::bounded(capacity);
        let (ack_tx, ack_rx) = flume::unbounded();
        let policy = DeliveryPolicy {
            max_retries: self.config.delivery.max_retries,
            backoff_base: self.config.delivery.backoff_base(),
            ack_timeout: self.config.delivery.ack_timeout(),
            min_delivery_interval: opts.min_delivery_interval,
        };
        let breaker = CircuitBreaker::new(
            self.config.breaker.failure_threshold,
            self.config.breaker.cooldown(),
        );
        let subscription = Arc::new(Subscription::new(
            id,
            pattern.to_string(),
            Arc::new(handler) as Handler,
            buffer_tx,
            ack_tx,
            breaker,
            policy,
        ));

        let ctx = WorkerContext {
            pending: Arc::clone(&self.pending),
            dead_letters: Arc::clone(&self.dead_letters),
            metrics: Arc::clone(&self.metrics),
        };
        subscription.register_task(spawn_worker(Arc::clone(&subscription), buffer_rx, ctx));
        subscription.register_task(spawn_ack_listener(Arc::clone(&subscription), ack_rx));

        self.registry.insert(id, subscription);
        info!(
            target: "relaymq::broker",
            subscription_id = %id,
            pattern,
            buffer_capacity = capacity,
            "subscription registered"
        );
        Ok(id)
    }

    /// Removes a subscription and signals its worker to stop. No further
    /// messages are routed to it; an in-flight handler call is not aborted.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let (_, subscription) = self
            .registry
            .remove(&id)
            .ok_or(BrokerError::NotFound(id))?;
        subscription.cancel();
        let purged = self.pending.remove_subscription(id);
        debug!(
            target: "relaymq::broker",
            subscription_id = %id,
            purged_pending = purged,
            "subscription removed"
        );
        Ok(())
    }

    /// Publishes a message to every subscription matching `topic`. Never
    /// blocks on a slow subscriber: a full buffer counts as that
    /// subscription's failure and feeds its circuit breaker. If nothing
    /// matches, the message is not retained anywhere.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) -> Result<u64, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if topic.trim().is_empty() {
            return Err(BrokerError::Validation("topic must not be empty".into()));
        }

        let message = Message::new(topic, payload, metadata);
        self.metrics.inc_published();
        let retained = Arc::new(message.clone());

        // Collect matches first so no shard lock is held while enqueueing.
        let matched: Vec<Arc<Subscription>> = self
            .registry
            .iter()
            .filter(|entry| topics::matches(entry.value().pattern(), topic))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for subscription in matched {
            if subscription.breaker().is_open() {
                // Routing decision, not a delivery failure: nothing is
                // buffered or dead-lettered for an open circuit.
                trace!(
                    target: "relaymq::broker",
                    subscription_id = %subscription.id(),
                    message_id = message.id,
                    reason = %BrokerError::CircuitOpen,
                    "skipping subscription"
                );
                continue;
            }
            let key = PendingKey::new(subscription.id(), message.id);
            self.pending.insert(key, Arc::clone(&retained));
            match subscription.try_enqueue(message.clone()) {
                Ok(()) => {
                    // An unsubscribe racing between the registry scan and
                    // this enqueue cannot purge an entry inserted after its
                    // purge ran; re-checking membership closes that window.
                    if !self.registry.contains_key(&subscription.id()) {
                        self.pending.remove(&key);
                    }
                }
                Err(BrokerError::BufferFull) => {
                    self.pending.remove(&key);
                    warn!(
                        target: "relaymq::broker",
                        subscription_id = %subscription.id(),
                        message_id = message.id,
                        "subscription buffer full; counting failure"
                    );
                    if subscription.breaker().record_failure() {
                        self.metrics.inc_circuit_trips();
                        warn!(
                            target: "relaymq::broker",
                            subscription_id = %subscription.id(),
                            "circuit opened after repeated failures"
                        );
                    }
                }
                Err(_) => {
                    // Subscription is tearing down; treat it like no match.
                    self.pending.remove(&key);
                }
            }
        }

        Ok(message.id)
    }

    /// Acknowledges one delivery. Unknown or already-acknowledged pairs are
    /// a no-op, which makes retrying consumers safe.
    pub fn ack(&self, subscription_id: SubscriptionId, message_id: u64) -> Result<(), BrokerError> {
        // Only a pair that was actually pending reaches the ack listener;
        // stray ids would otherwise sit in the acked set forever and could
        // pre-acknowledge a message assigned that id later.
        if self
            .pending
            .remove(&PendingKey::new(subscription_id, message_id))
        {
            if let Some(subscription) = self.registry.get(&subscription_id) {
                subscription.signal_ack(message_id);
            }
        }
        Ok(())
    }

    /// Snapshot copy of the dead-letter queue.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.snapshot()
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.pending.len(), self.dead_letters.len())
    }

    /// Number of outstanding (unacknowledged) delivery entries.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stops accepting work, cancels every subscription, and waits up to
    /// `drain_timeout` for the workers to stop. A timed-out drain is
    /// reported, not hidden: messages may remain unacknowledged.
    pub async fn close(&self, drain_timeout: Duration) -> Result<ShutdownReport, BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::Closed);
        }

        let ids: Vec<SubscriptionId> = self.registry.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::new();
        for id in ids {
            if let Some((_, subscription)) = self.registry.remove(&id) {
                subscription.cancel();
                handles.extend(subscription.take_tasks());
            }
        }

        let timed_out = timeout(drain_timeout, join_all(handles)).await.is_err();
        let report = ShutdownReport {
            pending: self.pending.len(),
            dead_lettered: self.dead_letters.len(),
            timed_out,
        };
        if timed_out {
            warn!(
                target: "relaymq::broker",
                pending = report.pending,
                dead_lettered = report.dead_lettered,
                reason = %BrokerError::ShutdownTimeout,
                "drain ended before all workers stopped"
            );
        } else {
            info!(
                target: "relaymq::broker",
                pending = report.pending,
                dead_lettered = report.dead_lettered,
                "broker closed"
            );
        }
        Ok(report)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(crate::config::CONFIG.clone())
    }
}
