#[path = "common.rs"]
mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use relaymq::{Broker, Config, SubscribeOptions, SubscriptionId};

/// Subscribes an auto-acking handler that also bumps a counter.
fn counting_subscriber(
    broker: &Arc<Broker>,
    pattern: &str,
) -> (SubscriptionId, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let cell: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
    let id = {
        let broker = Arc::clone(broker);
        let hits = Arc::clone(&hits);
        let cell = Arc::clone(&cell);
        broker
            .clone()
            .subscribe(
                pattern,
                move |msg| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    broker.ack(*cell.get().unwrap(), msg.id)?;
                    Ok(())
                },
                SubscribeOptions::default(),
            )
            .unwrap()
    };
    cell.set(id).unwrap();
    (id, hits)
}

#[tokio::test]
async fn message_is_fanned_out_to_wildcard_and_prefix_subscribers() {
    common::init_logging();
    let broker = Arc::new(Broker::new(Config::default()));

    let (_, prefix_hits) = counting_subscriber(&broker, "orders.*");
    let (_, star_hits) = counting_subscriber(&broker, "*");

    broker
        .publish("orders.created", "o1", HashMap::new())
        .unwrap();

    assert!(
        common::wait_until(
            || prefix_hits.load(Ordering::SeqCst) == 1 && star_hits.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2),
        )
        .await
    );

    // A bare "orders" topic does not cross the "orders.*" segment boundary.
    broker.publish("orders", "o2", HashMap::new()).unwrap();
    assert!(
        common::wait_until(|| star_hits.load(Ordering::SeqCst) == 2, Duration::from_secs(2)).await
    );
    assert_eq!(prefix_hits.load(Ordering::SeqCst), 1);

    // Everything acked, so nothing stays pending. The acknowledged counter
    // is bumped by the workers, a beat after the handlers call ack.
    assert!(common::wait_until(|| broker.pending_count() == 0, Duration::from_secs(2)).await);
    assert!(
        common::wait_until(|| broker.metrics().acknowledged == 3, Duration::from_secs(2)).await
    );
    let metrics = broker.metrics();
    assert_eq!(metrics.published, 2);
    assert!(metrics.dead_letter_size == 0);
}

#[tokio::test]
async fn unmatched_publish_is_not_retained() {
    common::init_logging();
    let broker = Arc::new(Broker::new(Config::default()));
    let (_, hits) = counting_subscriber(&broker, "billing.*");

    let id = broker.publish("orders.created", "x", HashMap::new()).unwrap();
    assert!(id > 0);
    assert_eq!(broker.pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn per_subscription_delivery_preserves_publish_order() {
    common::init_logging();
    let broker = Arc::new(Broker::new(Config::default()));

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let cell: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
    let id = {
        let broker = Arc::clone(&broker);
        let order = Arc::clone(&order);
        let cell = Arc::clone(&cell);
        broker
            .clone()
            .subscribe(
                "seq",
                move |msg| {
                    order
                        .lock()
                        .unwrap()
                        .push(String::from_utf8(msg.payload.to_vec()).unwrap());
                    broker.ack(*cell.get().unwrap(), msg.id)?;
                    Ok(())
                },
                SubscribeOptions::default(),
            )
            .unwrap()
    };
    cell.set(id).unwrap();

    for i in 0..20u32 {
        broker.publish("seq", format!("m{i}"), HashMap::new()).unwrap();
    }

    assert!(
        common::wait_until(|| order.lock().unwrap().len() == 20, Duration::from_secs(2)).await
    );
    let got = order.lock().unwrap().clone();
    let want: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(got, want);
}

#[tokio::test]
async fn metadata_travels_with_the_message() {
    common::init_logging();
    let broker = Arc::new(Broker::new(Config::default()));

    let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let cell: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
    let id = {
        let broker = Arc::clone(&broker);
        let seen = Arc::clone(&seen);
        let cell = Arc::clone(&cell);
        broker
            .clone()
            .subscribe(
                "events.*",
                move |msg| {
                    *seen.lock().unwrap() = msg.metadata.get("trace-id").cloned();
                    broker.ack(*cell.get().unwrap(), msg.id)?;
                    Ok(())
                },
                SubscribeOptions::default(),
            )
            .unwrap()
    };
    cell.set(id).unwrap();

    let mut metadata = HashMap::new();
    metadata.insert("trace-id".to_string(), "abc-123".to_string());
    broker.publish("events.signup", "payload", metadata).unwrap();

    assert!(
        common::wait_until(|| seen.lock().unwrap().is_some(), Duration::from_secs(2)).await
    );
    assert_eq!(seen.lock().unwrap().as_deref(), Some("abc-123"));
}
