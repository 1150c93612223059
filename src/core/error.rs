use std::fmt;

use crate::core::subscription::SubscriptionId;

/// Broker error taxonomy.
///
/// Only the structural variants (`Validation`, `NotFound`, `Closed`) surface
/// from the public API. The delivery-side variants drive retry and circuit
/// decisions inside the pipeline and show up as dead-letter and log reasons.
#[derive(Debug)]
pub enum BrokerError {
    Validation(String),
    NotFound(SubscriptionId),
    Closed,
    AckTimeout,
    Handler(String),
    CircuitOpen,
    BufferFull,
    ShutdownTimeout,
}

impl std::error::Error for BrokerError {}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Validation(msg) => write!(f, "invalid argument: {msg}"),
            BrokerError::NotFound(id) => write!(f, "unknown subscription {id}"),
            BrokerError::Closed => write!(f, "broker is closed"),
            BrokerError::AckTimeout => {
                write!(f, "acknowledgment not received within the ack window")
            }
            BrokerError::Handler(msg) => write!(f, "handler failed: {msg}"),
            BrokerError::CircuitOpen => write!(f, "circuit open; delivery skipped"),
            BrokerError::BufferFull => write!(f, "subscription buffer is full"),
            BrokerError::ShutdownTimeout => {
                write!(f, "shutdown grace period elapsed before drain completed")
            }
        }
    }
}
