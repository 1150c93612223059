//! In-flight (published, not yet acknowledged) message bookkeeping.
//!
//! One entry per `(subscription, message)` pair, created on the publish path
//! and removed by acknowledgment, dead-lettering, or subscription teardown.
//! An entry in the store means at least one delivery attempt is outstanding.

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::message::Message;
use crate::core::subscription::SubscriptionId;

/// Composite key: one pending entry per (subscription, message) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub subscription_id: SubscriptionId,
    pub message_id: u64,
}

impl PendingKey {
    pub fn new(subscription_id: SubscriptionId, message_id: u64) -> Self {
        Self {
            subscription_id,
            message_id,
        }
    }
}

/// Contract a pending store must satisfy.
///
/// The broker ships a DashMap-backed implementation; a durable backend can be
/// substituted through `Broker::with_stores` by honoring the same
/// insert/remove semantics.
pub trait PendingStore: Send + Sync {
    /// Records an outstanding delivery attempt.
    fn insert(&self, key: PendingKey, message: Arc<Message>);

    /// Removes one pending pair; returns whether it was present.
    fn remove(&self, key: &PendingKey) -> bool;

    /// Drops every entry belonging to one subscription, returning the count.
    fn remove_subscription(&self, id: SubscriptionId) -> usize;

    /// Approximate number of outstanding entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory pending store over a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    entries: DashMap<PendingKey, Arc<Message>>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl PendingStore for InMemoryPendingStore {
    fn insert(&self, key: PendingKey, message: Arc<Message>) {
        self.entries.insert(key, message);
    }

    fn remove(&self, key: &PendingKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn remove_subscription(&self, id: SubscriptionId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.subscription_id != id);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
