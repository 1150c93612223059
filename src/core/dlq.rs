//! Dead-letter queue: the permanent-failure record for messages that
//! exhausted their retry budget.
//!
//! Entries are append-only and never mutated after insertion. Reads return
//! snapshot copies so operators never hold a live reference into the log
//! while delivery workers keep appending.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::message::{current_timestamp, Message};
use crate::core::subscription::SubscriptionId;

/// Snapshot of one permanently failed delivery.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// The message as it looked on its final attempt (retry count included).
    pub message: Message,
    pub subscription_id: SubscriptionId,
    /// Display form of the last delivery error.
    pub reason: String,
    /// Unix-ms timestamp of the dead-lettering.
    pub failed_at: u64,
}

impl DeadLetterEntry {
    pub fn new(
        message: Message,
        subscription_id: SubscriptionId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message,
            subscription_id,
            reason: reason.into(),
            failed_at: current_timestamp(),
        }
    }
}

/// Contract a dead-letter store must satisfy.
///
/// Like `PendingStore`, this is the substitution point for a durable backend
/// via `Broker::with_stores`.
pub trait DeadLetterStore: Send + Sync {
    fn append(&self, entry: DeadLetterEntry);

    /// Owned copy of the current log, in append order.
    fn snapshot(&self) -> Vec<DeadLetterEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory log. When `max_entries` is reached the oldest entry is
/// evicted, so the queue cannot grow without limit. `max_entries == 0`
/// disables the cap.
#[derive(Debug)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    max_entries: usize,
}

impl InMemoryDeadLetterStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries,
        }
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn append(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.lock();
        if self.max_entries > 0 && entries.len() >= self.max_entries {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    target: "relaymq::dlq",
                    message_id = evicted.message.id,
                    subscription_id = %evicted.subscription_id,
                    "dead-letter queue at capacity; evicting oldest entry"
                );
            }
        }
        entries.push_back(entry);
    }

    fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
