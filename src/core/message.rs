use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single published message.
///
/// Every matching subscription receives its own clone, so `retry_count` is
/// owned by exactly one delivery worker and is never mutated concurrently.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub topic: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
    pub retry_count: u32,
    pub created_at: u64,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: generate_id(),
            topic: topic.into(),
            payload: payload.into(),
            metadata,
            retry_count: 0,
            created_at: current_timestamp(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// Generates a monotonically increasing u64 ID (fast, lock-free).
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
fn generate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
