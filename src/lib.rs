//! relaymq – an embeddable, reliable in-process publish/subscribe broker.
//!
//! This crate exports
//!  * `core`    – messages, topic matching, pending bookkeeping, circuit
//!                breaking, and the per-subscription delivery pipeline
//!  * `broker`  – the [`Broker`] facade (subscribe / publish / ack / close)
//!  * `config`  – TOML-driven runtime configuration
//!  * `metrics` – lock-free broker counters
//!
//! Delivery is at-least-once: a message is redelivered with exponential
//! backoff until it is acknowledged or its retry budget is spent, at which
//! point it lands in the dead-letter queue. Publish never blocks on a slow
//! subscriber; a full buffer feeds that subscription's circuit breaker
//! instead.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::broker::{Broker, ShutdownReport};
pub use crate::config::{load_config, Config};
pub use crate::core::dlq::DeadLetterEntry;
pub use crate::core::error::BrokerError;
pub use crate::core::message::Message;
pub use crate::core::subscription::{Handler, SubscribeOptions, SubscriptionId};
pub use crate::metrics::MetricsSnapshot;
