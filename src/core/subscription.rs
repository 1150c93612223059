//! Subscription state and the per-subscription delivery pipeline.
//!
//! Each subscription owns a bounded buffer drained by exactly one worker
//! task, which makes per-subscription FIFO a structural property: the worker
//! is the sole consumer of the buffer and the sole writer of the delivery
//! state machine. A second small task listens for acknowledgments and flags
//! them for whichever attempt is waiting.
//!
//! Cancellation is cooperative. The worker observes the watch channel at
//! every suspension point (buffer wait, rate gate, backoff sleep, ack wait)
//! and exits promptly, removing the pending entries of anything it abandons.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::core::breaker::CircuitBreaker;
use crate::core::dlq::DeadLetterEntry;
use crate::core::error::BrokerError;
use crate::core::message::Message;
use crate::core::pending::PendingKey;
use crate::metrics::BrokerMetrics;

/// Unique identifier for a subscription, assigned at subscribe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubscriptionId {
    fn from(id: u64) -> Self {
        SubscriptionId(id)
    }
}

/// Opaque, fallible message handler supplied by the caller.
///
/// Handlers run on the blocking pool and may block arbitrarily; a returned
/// error or a panic counts as a failed attempt and drives the retry path.
pub type Handler = Arc<dyn Fn(Message) -> anyhow::Result<()> + Send + Sync>;

/// Per-subscription overrides accepted by `Broker::subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Buffer capacity override; must be non-zero when set.
    pub buffer_capacity: Option<usize>,
    /// Minimum gap between consecutive handler invocations (rate gate).
    pub min_delivery_interval: Option<Duration>,
}

/// Retry and timing knobs resolved for one subscription.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) ack_timeout: Duration,
    pub(crate) min_delivery_interval: Option<Duration>,
}

/// One registered subscription: pattern, handler, buffer, circuit state.
///
/// Mutable state is narrow by construction: the publish path only appends
/// into the buffer and reads/feeds the breaker; everything else belongs to
/// the subscription's own worker.
pub struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
    buffer_tx: flume::Sender<Message>,
    ack_tx: flume::Sender<u64>,
    acked: DashSet<u64>,
    ack_notify: Notify,
    breaker: CircuitBreaker,
    policy: DeliveryPolicy,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        pattern: String,
        handler: Handler,
        buffer_tx: flume::Sender<Message>,
        ack_tx: flume::Sender<u64>,
        breaker: CircuitBreaker,
        policy: DeliveryPolicy,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            id,
            pattern,
            handler,
            buffer_tx,
            ack_tx,
            acked: DashSet::new(),
            ack_notify: Notify::new(),
            breaker,
            policy,
            cancel_tx,
            cancel_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Non-blocking enqueue used by the publish path.
    pub(crate) fn try_enqueue(&self, message: Message) -> Result<(), BrokerError> {
        self.buffer_tx.try_send(message).map_err(|e| match e {
            flume::TrySendError::Full(_) => BrokerError::BufferFull,
            flume::TrySendError::Disconnected(_) => BrokerError::Closed,
        })
    }

    /// Forwards an acknowledgment to this subscription's ack listener.
    pub(crate) fn signal_ack(&self, message_id: u64) {
        let _ = self.ack_tx.send(message_id);
    }

    /// Requests cooperative cancellation; the worker observes it at its next
    /// suspension point.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub(crate) fn register_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}

/// Shared stores and counters handed to each subscription's tasks.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) pending: Arc<dyn crate::core::pending::PendingStore>,
    pub(crate) dead_letters: Arc<dyn crate::core::dlq::DeadLetterStore>,
    pub(crate) metrics: Arc<BrokerMetrics>,
}

/// Spawns the ack listener: drains the subscription's ack channel into the
/// acked set and wakes any delivery attempt waiting on it.
pub(crate) fn spawn_ack_listener(
    sub: Arc<Subscription>,
    ack_rx: flume::Receiver<u64>,
) -> JoinHandle<()> {
    let mut cancel = sub.cancel_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.wait_for(|c| *c) => break,
                res = ack_rx.recv_async() => match res {
                    Ok(message_id) => {
                        sub.acked.insert(message_id);
                        sub.ack_notify.notify_waiters();
                    }
                    Err(_) => break,
                },
            }
        }
    })
}

/// Spawns the delivery worker: drains the buffer strictly in enqueue order
/// and runs the retry/ack state machine for each message.
pub(crate) fn spawn_worker(
    sub: Arc<Subscription>,
    buffer_rx: flume::Receiver<Message>,
    ctx: WorkerContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cancel = sub.cancel_rx.clone();
        let mut last_invocation: Option<Instant> = None;
        loop {
            let message = tokio::select! {
                _ = cancel.wait_for(|c| *c) => break,
                recv = buffer_rx.recv_async() => match recv {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            let flow = deliver(&sub, message, &mut cancel, &mut last_invocation, &ctx).await;
            if flow == Flow::Cancelled {
                break;
            }
        }
        // Teardown: undelivered messages are abandoned, and their pending
        // entries go with them.
        while let Ok(message) = buffer_rx.try_recv() {
            ctx.pending.remove(&PendingKey::new(sub.id, message.id));
        }
        debug!(
            target: "relaymq::delivery",
            subscription_id = %sub.id,
            "delivery worker stopped"
        );
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

enum Attempt {
    Acked,
    Failed(BrokerError),
    Cancelled,
}

enum AckWait {
    Acked,
    TimedOut,
    Cancelled,
}

/// Runs one message through the attempt/retry state machine until it is
/// acknowledged, dead-lettered, or the subscription is cancelled.
async fn deliver(
    sub: &Subscription,
    mut message: Message,
    cancel: &mut watch::Receiver<bool>,
    last_invocation: &mut Option<Instant>,
    ctx: &WorkerContext,
) -> Flow {
    // Optional rate gate between consecutive deliveries.
    if let (Some(gap), Some(last)) = (sub.policy.min_delivery_interval, *last_invocation) {
        tokio::select! {
            _ = cancel.wait_for(|c| *c) => return Flow::Cancelled,
            _ = sleep_until(last + gap) => {}
        }
    }

    loop {
        *last_invocation = Some(Instant::now());
        match attempt(sub, &message, cancel, ctx).await {
            Attempt::Acked => {
                sub.breaker.record_success();
                ctx.metrics.inc_acknowledged();
                trace!(
                    target: "relaymq::delivery",
                    subscription_id = %sub.id,
                    message_id = message.id,
                    "message acknowledged"
                );
                return Flow::Continue;
            }
            Attempt::Cancelled => return Flow::Cancelled,
            Attempt::Failed(reason) => {
                message.retry_count += 1;
                if message.retry_count <= sub.policy.max_retries {
                    ctx.metrics.inc_retries();
                    let backoff =
                        sub.policy.backoff_base * 2u32.saturating_pow(message.retry_count - 1);
                    debug!(
                        target: "relaymq::delivery",
                        subscription_id = %sub.id,
                        message_id = message.id,
                        retry = message.retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "delivery failed; backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.wait_for(|c| *c) => return Flow::Cancelled,
                        _ = sleep(backoff) => {}
                    }
                } else {
                    dead_letter(sub, message, reason, ctx);
                    return Flow::Continue;
                }
            }
        }
    }
}

/// One delivery attempt: `Dequeued -> HandlerInvoked -> {AckedOK |
/// AckTimedOut | HandlerError}`. The whole attempt is bounded by the ack
/// timeout measured from invocation start.
async fn attempt(
    sub: &Subscription,
    message: &Message,
    cancel: &mut watch::Receiver<bool>,
    ctx: &WorkerContext,
) -> Attempt {
    let handler = sub.handler.clone();
    let delivery = message.clone();
    let started = Instant::now();
    let deadline = started + sub.policy.ack_timeout;

    let mut invocation = tokio::task::spawn_blocking(move || handler(delivery));
    ctx.metrics.inc_delivered();

    let handler_result = tokio::select! {
        res = &mut invocation => res,
        _ = sleep_until(deadline) => {
            // The handler keeps running on the blocking pool; the attempt is
            // charged as a timeout and the worker moves on.
            return Attempt::Failed(BrokerError::AckTimeout);
        }
        _ = cancel.wait_for(|c| *c) => return Attempt::Cancelled,
    };

    match handler_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Attempt::Failed(BrokerError::Handler(err.to_string())),
        // A panicking handler is caught at the join boundary and treated
        // exactly like a returned error.
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                join_err.to_string()
            };
            return Attempt::Failed(BrokerError::Handler(reason));
        }
    }

    match wait_for_ack(sub, message.id, deadline, cancel).await {
        AckWait::Acked => {
            ctx.metrics.observe_handler_latency(started.elapsed());
            Attempt::Acked
        }
        AckWait::TimedOut => Attempt::Failed(BrokerError::AckTimeout),
        AckWait::Cancelled => Attempt::Cancelled,
    }
}

async fn wait_for_ack(
    sub: &Subscription,
    message_id: u64,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> AckWait {
    loop {
        // Register for wakeups before checking, so an ack landing in between
        // is not missed.
        let notified = sub.ack_notify.notified();
        if sub.acked.remove(&message_id).is_some() {
            return AckWait::Acked;
        }
        tokio::select! {
            _ = notified => {}
            _ = sleep_until(deadline) => return AckWait::TimedOut,
            _ = cancel.wait_for(|c| *c) => return AckWait::Cancelled,
        }
    }
}

fn dead_letter(sub: &Subscription, message: Message, reason: BrokerError, ctx: &WorkerContext) {
    let key = PendingKey::new(sub.id, message.id);
    ctx.pending.remove(&key);
    // Drop any ack that arrives after the retry budget is spent so the set
    // cannot accumulate stale ids.
    sub.acked.remove(&message.id);
    warn!(
        target: "relaymq::delivery",
        subscription_id = %sub.id,
        message_id = message.id,
        attempts = message.retry_count,
        %reason,
        "retry budget exhausted; dead-lettering message"
    );
    ctx.dead_letters
        .append(DeadLetterEntry::new(message, sub.id, reason.to_string()));
    ctx.metrics.inc_dead_lettered();
    if sub.breaker.record_failure() {
        ctx.metrics.inc_circuit_trips();
        warn!(
            target: "relaymq::delivery",
            subscription_id = %sub.id,
            "circuit opened after repeated failures"
        );
    }
}
