//! Core broker building blocks: messages, topic routing, pending
//! bookkeeping, circuit breaking, the dead-letter queue, and the
//! per-subscription delivery pipeline.

pub mod breaker;
pub mod dlq;
pub mod error;
pub mod message;
pub mod pending;
pub mod subscription;
pub mod topics;
