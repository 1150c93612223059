#[path = "common.rs"]
mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use relaymq::{Broker, SubscribeOptions, SubscriptionId};

/// Concurrent publish / subscribe / unsubscribe / ack from many tasks must
/// not corrupt the registry or the pending store. Run under a race detector
/// (`cargo test` with ThreadSanitizer or `cargo miri` where applicable) for
/// full effect; the assertions here catch logical corruption.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lifecycle_does_not_corrupt_state() {
    common::init_logging();
    let mut cfg = common::fast_config();
    cfg.delivery.ack_timeout_ms = 2_000;
    let broker = Arc::new(Broker::new(cfg));

    // One durable subscriber that acks everything it sees.
    let delivered = Arc::new(AtomicUsize::new(0));
    let cell: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
    let durable = {
        let broker = Arc::clone(&broker);
        let delivered = Arc::clone(&delivered);
        let cell = Arc::clone(&cell);
        broker
            .clone()
            .subscribe(
                "load.*",
                move |msg| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    broker.ack(*cell.get().unwrap(), msg.id)?;
                    Ok(())
                },
                SubscribeOptions {
                    buffer_capacity: Some(1024),
                    min_delivery_interval: None,
                },
            )
            .unwrap()
    };
    cell.set(durable).unwrap();

    let mut tasks = Vec::new();

    // Publishers.
    for p in 0..4 {
        let broker = Arc::clone(&broker);
        tasks.push(tokio::spawn(async move {
            for i in 0..100 {
                broker
                    .publish(&format!("load.p{p}"), format!("m{i}"), HashMap::new())
                    .unwrap();
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    // Churners: subscribe and unsubscribe short-lived subscriptions while
    // publishing is in flight.
    for _ in 0..2 {
        let broker = Arc::clone(&broker);
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let id = broker
                    .subscribe("load.*", |_msg| Ok(()), SubscribeOptions::default())
                    .unwrap();
                tokio::task::yield_now().await;
                broker.unsubscribe(id).unwrap();
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    // The durable subscriber sees all 400 messages exactly in publish order
    // per publisher; globally we only require the count.
    assert!(
        common::wait_until(
            || delivered.load(Ordering::SeqCst) == 400,
            Duration::from_secs(10)
        )
        .await,
        "delivered {} of 400",
        delivered.load(Ordering::SeqCst)
    );
    assert!(
        common::wait_until(|| broker.pending_count() == 0, Duration::from_secs(10)).await,
        "pending should drain to zero, got {}",
        broker.pending_count()
    );
    // Wait for the worker-side counter before closing: cancellation could
    // otherwise cut off the bump for the very last acknowledgment.
    assert!(
        common::wait_until(
            || broker.metrics().acknowledged == 400,
            Duration::from_secs(10)
        )
        .await,
        "acknowledged {} of 400",
        broker.metrics().acknowledged
    );

    let report = broker.close(Duration::from_secs(2)).await.unwrap();
    assert!(!report.timed_out);

    let metrics = broker.metrics();
    assert_eq!(metrics.published, 400);
    assert_eq!(metrics.acknowledged, 400);
}
