#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Once;
use std::time::Duration;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        relaymq::logging::init_logging();
    });
}

/// Polls `predicate` every few milliseconds until it holds or `deadline`
/// elapses; returns the final value of the predicate.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

/// Config with short timers so failure paths run quickly in tests.
pub fn fast_config() -> relaymq::Config {
    let mut cfg = relaymq::Config::default();
    cfg.delivery.max_retries = 2;
    cfg.delivery.backoff_base_ms = 10;
    cfg.delivery.ack_timeout_ms = 200;
    cfg.breaker.failure_threshold = 10;
    cfg.breaker.cooldown_ms = 300;
    cfg
}
