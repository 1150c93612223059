use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Default per-subscription buffer bound; overridable per subscription.
    pub buffer_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    /// First backoff; doubles on every further retry.
    pub backoff_base_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            ack_timeout_ms: 30_000,
        }
    }
}

impl DeliveryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DlqConfig {
    /// Cap on the in-memory dead-letter queue; 0 disables the cap.
    pub max_entries: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub subscriptions: SubscriptionConfig,
    pub delivery: DeliveryConfig,
    pub breaker: BreakerConfig,
    pub dlq: DlqConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

/// Process-wide defaults; honors `RELAYMQ_CONFIG` when it points at a TOML
/// file, otherwise falls back to the built-in defaults.
pub static CONFIG: Lazy<Config> = Lazy::new(|| match std::env::var("RELAYMQ_CONFIG") {
    Ok(path) => load_config(&path).unwrap_or_else(|err| {
        tracing::warn!(
            target: "relaymq::config",
            path = %path,
            error = %err,
            "failed to load config file; using defaults"
        );
        Config::default()
    }),
    Err(_) => Config::default(),
});
