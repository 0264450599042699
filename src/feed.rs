//! Work feed: pulls invocation messages from the broker, enforces
//! per-namespace concurrency, and hands work to the pool with bounded
//! backoff on rejection.
//!
//! Messages are acknowledged only after their activation reached a terminal
//! outcome (a record was produced); messages held for namespace capacity
//! stay unacknowledged so the broker can redeliver them elsewhere if this
//! invoker dies.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::InvokerConfig,
    error::ActivationError,
    metrics::InvokerMetrics,
    objects::{InvocationMessage, WorkItem},
    pool::PoolHandle,
    runner,
    store::{ActionStore, ActivationSink},
};

/// How long the feed sleeps when it has no capacity to poll.
const CAPACITY_WAIT: Duration = Duration::from_millis(50);

/// One pulled message with its acknowledge handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub message: InvocationMessage,
}

/// Pull source with explicit per-message acknowledge.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait briefly for up to `max` messages; an empty vec means nothing
    /// arrived in the window.
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<Delivery>>;
    async fn ack(&self, tag: u64);
    async fn nack(&self, tag: u64);
}

/// In-process message source backed by a channel; the broker stand-in for
/// tests and single-process deployments.
pub struct ChannelMessageSource {
    rx: Mutex<mpsc::UnboundedReceiver<InvocationMessage>>,
    next_tag: AtomicU64,
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<u64>>,
}

impl ChannelMessageSource {
    pub fn new() -> (mpsc::UnboundedSender<InvocationMessage>, Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Arc::new(Self {
                rx: Mutex::new(rx),
                next_tag: AtomicU64::new(1),
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
            }),
        )
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.acked.lock().await.clone()
    }

    pub async fn nacked(&self) -> Vec<u64> {
        self.nacked.lock().await.clone()
    }
}

#[async_trait]
impl MessageSource for ChannelMessageSource {
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<Delivery>> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();

        // Block briefly for the first message, then drain whatever else is
        // immediately available up to the batch size.
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(message)) => out.push(Delivery {
                tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
                message,
            }),
            Ok(None) | Err(_) => return Ok(out),
        }
        while out.len() < max {
            match rx.try_recv() {
                Ok(message) => out.push(Delivery {
                    tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
                    message,
                }),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, tag: u64) {
        self.acked.lock().await.push(tag);
    }

    async fn nack(&self, tag: u64) {
        self.nacked.lock().await.push(tag);
    }
}

struct Done {
    namespace: String,
}

pub struct WorkFeed {
    source: Arc<dyn MessageSource>,
    actions: Arc<dyn ActionStore>,
    results: Arc<dyn ActivationSink>,
    pool: PoolHandle,
    metrics: Arc<InvokerMetrics>,
    config: Arc<InvokerConfig>,
}

impl WorkFeed {
    pub fn new(
        source: Arc<dyn MessageSource>,
        actions: Arc<dyn ActionStore>,
        results: Arc<dyn ActivationSink>,
        pool: PoolHandle,
        metrics: Arc<InvokerMetrics>,
        config: Arc<InvokerConfig>,
    ) -> Self {
        Self {
            source,
            actions,
            results,
            pool,
            metrics,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
        let mut ns_inflight: HashMap<String, usize> = HashMap::new();
        let mut held: VecDeque<Delivery> = VecDeque::new();
        let mut total_inflight = 0usize;
        let ns_cap = self.config.namespace_concurrency_default;
        let batch = self.config.concurrent_peek;

        info!(
            concurrent_peek = batch,
            namespace_concurrency = ns_cap,
            "work feed starting"
        );

        loop {
            // Settle finished work first; the channel is drained without
            // awaiting so a ready poll future is never raced and dropped
            // with messages inside it.
            while let Ok(done) = done_rx.try_recv() {
                total_inflight = total_inflight.saturating_sub(1);
                if let Some(used) = ns_inflight.get_mut(&done.namespace) {
                    *used = used.saturating_sub(1);
                }
            }

            // Promote held messages whose namespace has room again.
            let mut still_held = VecDeque::new();
            while let Some(delivery) = held.pop_front() {
                let used = ns_inflight
                    .get(&delivery.message.namespace)
                    .copied()
                    .unwrap_or(0);
                if used < ns_cap && total_inflight < batch {
                    self.dispatch(delivery, &mut ns_inflight, &mut total_inflight, &done_tx);
                } else {
                    still_held.push_back(delivery);
                }
            }
            held = still_held;

            let can_poll = total_inflight < batch;

            tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.source.poll(batch.saturating_sub(total_inflight)), if can_poll => {
                    match polled {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                let used = ns_inflight
                                    .get(&delivery.message.namespace)
                                    .copied()
                                    .unwrap_or(0);
                                if used < ns_cap {
                                    self.dispatch(
                                        delivery,
                                        &mut ns_inflight,
                                        &mut total_inflight,
                                        &done_tx,
                                    );
                                } else {
                                    // At the namespace cap: hold, unacknowledged.
                                    debug!(
                                        namespace = %delivery.message.namespace,
                                        "holding message at namespace concurrency cap"
                                    );
                                    held.push_back(delivery);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "message poll failed");
                            tokio::time::sleep(CAPACITY_WAIT).await;
                        }
                    }
                }
                _ = tokio::time::sleep(CAPACITY_WAIT), if !can_poll => {}
            }
        }

        // Shutdown: stop pulling, let in-flight work finish inside the
        // grace window, then give held messages back to the broker.
        info!(
            in_flight = total_inflight,
            held = held.len(),
            "work feed draining"
        );
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        while total_inflight > 0 {
            tokio::select! {
                Some(done) = done_rx.recv() => {
                    total_inflight = total_inflight.saturating_sub(1);
                    if let Some(used) = ns_inflight.get_mut(&done.namespace) {
                        *used = used.saturating_sub(1);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(abandoned = total_inflight, "feed drain grace expired");
                    break;
                }
            }
        }
        for delivery in held {
            self.source.nack(delivery.tag).await;
        }
        info!("work feed stopped");
    }

    fn dispatch(
        &self,
        delivery: Delivery,
        ns_inflight: &mut HashMap<String, usize>,
        total_inflight: &mut usize,
        done_tx: &mpsc::UnboundedSender<Done>,
    ) {
        *ns_inflight
            .entry(delivery.message.namespace.clone())
            .or_insert(0) += 1;
        *total_inflight += 1;

        let source = self.source.clone();
        let actions = self.actions.clone();
        let results = self.results.clone();
        let pool = self.pool.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let namespace = delivery.message.namespace.clone();
            process_one(source, actions, results, pool, metrics, config, delivery).await;
            let _ = done_tx.send(Done { namespace });
        });
    }
}

/// Drive one message to a terminal outcome: exactly one activation record,
/// then acknowledge.
async fn process_one(
    source: Arc<dyn MessageSource>,
    actions: Arc<dyn ActionStore>,
    results: Arc<dyn ActivationSink>,
    pool: PoolHandle,
    metrics: Arc<InvokerMetrics>,
    config: Arc<InvokerConfig>,
    delivery: Delivery,
) {
    let message = delivery.message;
    let enqueued_at = Instant::now();

    let action = match actions
        .get_action(&message.namespace, &message.action, &message.revision)
        .await
    {
        Ok(Some(action)) => action,
        Ok(None) => {
            let err = ActivationError::ActionNotFound(format!(
                "{}/{}@{}",
                message.namespace, message.action, message.revision
            ));
            emit_feed_failure(&results, &metrics, &message, None, &err, 0).await;
            source.ack(delivery.tag).await;
            return;
        }
        Err(e) => {
            let err = ActivationError::Internal(format!("action lookup failed: {}", e));
            emit_feed_failure(&results, &metrics, &message, None, &err, 0).await;
            source.ack(delivery.tag).await;
            return;
        }
    };

    let item = WorkItem {
        message,
        action,
        enqueued_at,
    };

    let backoff = config.submit_backoff();
    let mut delay = backoff.first();
    let mut rejections = 0u32;
    loop {
        if item.message.remaining_ms() == 0 {
            let wait_ms = enqueued_at.elapsed().as_millis() as u64;
            emit_feed_failure(
                &results,
                &metrics,
                &item.message,
                Some(&item.action),
                &ActivationError::SystemOverloaded,
                wait_ms,
            )
            .await;
            break;
        }
        match pool.submit(item.clone()).await {
            // The runner already wrote the record, whatever the status.
            Ok(_record) => break,
            Err(ActivationError::SystemOverloaded) => {
                metrics.counters.feed_rejections.add(1, &[]);
                rejections += 1;
                if rejections > config.submit_max_retries {
                    let wait_ms = enqueued_at.elapsed().as_millis() as u64;
                    emit_feed_failure(
                        &results,
                        &metrics,
                        &item.message,
                        Some(&item.action),
                        &ActivationError::SystemOverloaded,
                        wait_ms,
                    )
                    .await;
                    break;
                }
                debug!(
                    activation_id = %item.message.activation_id,
                    rejections,
                    delay_ms = delay.as_millis() as u64,
                    "pool rejected submission, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next(delay);
            }
            Err(other) => {
                let wait_ms = enqueued_at.elapsed().as_millis() as u64;
                emit_feed_failure(
                    &results,
                    &metrics,
                    &item.message,
                    Some(&item.action),
                    &other,
                    wait_ms,
                )
                .await;
                break;
            }
        }
    }

    source.ack(delivery.tag).await;
}

async fn emit_feed_failure(
    results: &Arc<dyn ActivationSink>,
    metrics: &Arc<InvokerMetrics>,
    message: &InvocationMessage,
    action: Option<&crate::objects::ActionDescriptor>,
    err: &ActivationError,
    wait_ms: u64,
) {
    let record = runner::failure_record(message, action, err, wait_ms, None);
    metrics.record_activation(record.status);
    if let Err(e) = results.record(&record).await {
        warn!(
            activation_id = %record.activation_id,
            error = %e,
            "failed to write activation record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> InvocationMessage {
        InvocationMessage {
            activation_id: id.to_string(),
            namespace: "guest".to_string(),
            action: "echo".to_string(),
            revision: "1".to_string(),
            args: serde_json::json!({}),
            transid: format!("tid-{}", id),
            deadline_ms: crate::objects::now_ms() + 60_000,
        }
    }

    #[tokio::test]
    async fn test_channel_source_polls_in_order() {
        let (tx, source) = ChannelMessageSource::new();
        tx.send(message("a1")).unwrap();
        tx.send(message("a2")).unwrap();

        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message.activation_id, "a1");
        assert_eq!(batch[1].message.activation_id, "a2");
        assert_ne!(batch[0].tag, batch[1].tag);
    }

    #[tokio::test]
    async fn test_channel_source_respects_batch_size() {
        let (tx, source) = ChannelMessageSource::new();
        for i in 0..5 {
            tx.send(message(&format!("a{}", i))).unwrap();
        }
        let batch = source.poll(3).await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_channel_source_empty_poll() {
        let (_tx, source) = ChannelMessageSource::new();
        let batch = source.poll(10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_ack_nack_bookkeeping() {
        let (tx, source) = ChannelMessageSource::new();
        tx.send(message("a1")).unwrap();
        let batch = source.poll(1).await.unwrap();
        source.ack(batch[0].tag).await;
        source.nack(99).await;
        assert_eq!(source.acked().await, vec![batch[0].tag]);
        assert_eq!(source.nacked().await, vec![99]);
    }
}
