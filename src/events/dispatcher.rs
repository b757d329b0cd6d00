use super::event::{dlq_topic, event_topic, DispatchEvent};
use super::producer::EventProducer;
use crate::config::EventsConfig;
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Signed so a release that lands on a freshly inserted counter dips below
/// zero and recovers on the next enqueue instead of wrapping.
type PendingMap = Arc<DashMap<String, Arc<AtomicI64>>>;

/// Hot-path handle. Enqueue never waits; a full queue or an exhausted tenant
/// quota drops the event and counts it.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::Sender<DispatchEvent>,
    pending: PendingMap,
    max_pending_per_tenant: usize,
    metrics: Arc<MetricsRegistry>,
}

impl EventDispatcher {
    pub fn try_enqueue(&self, event: DispatchEvent) -> bool {
        let tenant = event.tenant_id.clone();
        let counter = self
            .pending
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        if counter.fetch_add(1, Ordering::AcqRel) >= self.max_pending_per_tenant as i64 {
            counter.fetch_sub(1, Ordering::AcqRel);
            self.dropped(&tenant, "tenant_quota");
            return false;
        }
        if self.tx.try_send(event).is_err() {
            counter.fetch_sub(1, Ordering::AcqRel);
            self.dropped(&tenant, "queue_full");
            return false;
        }
        self.metrics
            .counter_inc("courier_mq_enqueued_total", 1, &[("tenant", &tenant)]);
        true
    }

    pub fn pending_for(&self, tenant_id: &str) -> usize {
        self.pending
            .get(tenant_id)
            .map(|c| c.load(Ordering::Acquire).max(0) as usize)
            .unwrap_or(0)
    }

    fn dropped(&self, tenant_id: &str, reason: &str) {
        self.metrics.counter_inc(
            "courier_mq_dropped_total",
            1,
            &[("tenant", tenant_id), ("reason", reason)],
        );
    }
}

fn release_pending(pending: &PendingMap, tenant_id: &str) {
    let Some(counter) = pending.get(tenant_id).map(|c| c.clone()) else {
        return;
    };
    if counter.fetch_sub(1, Ordering::AcqRel) <= 1 {
        pending.remove_if(tenant_id, |_, c| c.load(Ordering::Acquire) <= 0);
    }
}

/// Retry policy for one topic family.
struct Publisher<C: Clock> {
    producer: Arc<dyn EventProducer>,
    metrics: Arc<MetricsRegistry>,
    clock: C,
    max_attempts: u32,
    backoff_base: Duration,
    topic_kind: &'static str,
}

enum PublishResult {
    Published,
    Exhausted,
    Interrupted,
}

impl<C: Clock> Publisher<C> {
    fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        (self.backoff_base * factor).min(MAX_BACKOFF)
    }

    async fn publish(
        &self,
        event: &mut DispatchEvent,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PublishResult {
        let tenant = event.tenant_id.clone();
        let event_type = event.event_type.label();
        let topic = if self.topic_kind == "dlq" {
            dlq_topic(&tenant)
        } else {
            event_topic(&tenant)
        };
        let value = match event.encode() {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(tenant = %tenant, event_type, "event encode failed: {err}");
                return PublishResult::Exhausted;
            }
        };
        let labels = [
            ("tenant", tenant.as_str()),
            ("topic", self.topic_kind),
            ("event_type", event_type),
        ];
        for attempt in 1..=self.max_attempts {
            event.attempt += 1;
            if self
                .producer
                .produce(&topic, event.user_id.as_bytes(), &value)
                .await
            {
                self.metrics.counter_inc("courier_mq_published_total", 1, &labels);
                return PublishResult::Published;
            }
            self.metrics.counter_inc("courier_mq_failed_total", 1, &labels);
            if attempt == self.max_attempts {
                break;
            }
            self.metrics.counter_inc("courier_mq_retry_total", 1, &labels);
            let delay = self.backoff(attempt);
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.clock.sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return PublishResult::Interrupted;
                    }
                }
            }
        }
        PublishResult::Exhausted
    }
}

/// Consumes the main queue. Events that exhaust their attempts move to the
/// DLQ fallback queue.
pub struct DispatchWorker<C: Clock> {
    publisher: Publisher<C>,
    rx: mpsc::Receiver<DispatchEvent>,
    dlq_tx: mpsc::Sender<DispatchEvent>,
    pending: PendingMap,
}

impl<C: Clock> DispatchWorker<C> {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(mut event) = event else { break };
                    let result = self.publisher.publish(&mut event, &mut shutdown).await;
                    release_pending(&self.pending, &event.tenant_id);
                    match result {
                        PublishResult::Published => {}
                        PublishResult::Exhausted => self.hand_to_dlq(event),
                        PublishResult::Interrupted => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn hand_to_dlq(&self, mut event: DispatchEvent) {
        event.to_dlq = true;
        event.attempt = 0;
        let tenant = event.tenant_id.clone();
        if self.dlq_tx.try_send(event).is_err() {
            self.publisher.metrics.counter_inc(
                "courier_mq_dropped_total",
                1,
                &[("tenant", &tenant), ("reason", "dlq_queue_full")],
            );
            tracing::warn!(tenant = %tenant, "event dropped: dlq queue full");
        }
    }
}

/// Consumes the DLQ fallback queue with its own attempt budget.
pub struct DlqWorker<C: Clock> {
    publisher: Publisher<C>,
    rx: mpsc::Receiver<DispatchEvent>,
}

impl<C: Clock> DlqWorker<C> {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(mut event) = event else { break };
                    let tenant = event.tenant_id.clone();
                    match self.publisher.publish(&mut event, &mut shutdown).await {
                        PublishResult::Published => {
                            self.publisher.metrics.counter_inc(
                                "courier_mq_dlq_total",
                                1,
                                &[("tenant", &tenant), ("event_type", event.event_type.label())],
                            );
                        }
                        PublishResult::Exhausted => {
                            self.publisher.metrics.counter_inc(
                                "courier_mq_dropped_total",
                                1,
                                &[("tenant", &tenant), ("reason", "dlq_failed")],
                            );
                            tracing::warn!(
                                tenant = %tenant,
                                event_type = event.event_type.label(),
                                msg = %event.msg_id,
                                "event dropped after dlq attempts"
                            );
                        }
                        PublishResult::Interrupted => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Build the enqueue handle and both background workers.
pub fn dispatch_pipeline<C: Clock>(
    cfg: &EventsConfig,
    producer: Arc<dyn EventProducer>,
    metrics: Arc<MetricsRegistry>,
    clock: C,
) -> (EventDispatcher, DispatchWorker<C>, DlqWorker<C>) {
    let capacity = cfg.queue_capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let (dlq_tx, dlq_rx) = mpsc::channel(cfg.dlq_queue_capacity.max(1));
    let pending: PendingMap = Arc::new(DashMap::new());
    let max_pending_per_tenant = if cfg.max_pending_per_tenant == 0 {
        capacity
    } else {
        cfg.max_pending_per_tenant
    };
    let dispatcher = EventDispatcher {
        tx,
        pending: pending.clone(),
        max_pending_per_tenant,
        metrics: metrics.clone(),
    };
    let worker = DispatchWorker {
        publisher: Publisher {
            producer: producer.clone(),
            metrics: metrics.clone(),
            clock: clock.clone(),
            max_attempts: cfg.max_attempts.clamp(1, 10),
            backoff_base: Duration::from_millis(cfg.retry_backoff_base_ms),
            topic_kind: "event",
        },
        rx,
        dlq_tx,
        pending,
    };
    let dlq = DlqWorker {
        publisher: Publisher {
            producer,
            metrics,
            clock,
            max_attempts: cfg.dlq_max_attempts.clamp(1, 10),
            backoff_base: Duration::from_millis(cfg.dlq_backoff_base_ms),
            topic_kind: "dlq",
        },
        rx: dlq_rx,
    };
    (dispatcher, worker, dlq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFactory;
    use crate::config::ProducerKind;
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Rejects everything on topics listed in `fail_topics`.
    #[derive(Default)]
    struct ScriptedProducer {
        fail_topics: Vec<String>,
        produced: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventProducer for ScriptedProducer {
        async fn produce(&self, topic: &str, _key: &[u8], _value: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_topics.iter().any(|t| t == topic) {
                return false;
            }
            self.produced.lock().push(topic.to_string());
            true
        }
    }

    fn cfg() -> EventsConfig {
        EventsConfig {
            producer: ProducerKind::Noop,
            queue_capacity: 8,
            max_pending_per_tenant: 2,
            max_attempts: 3,
            retry_backoff_base_ms: 1,
            dlq_queue_capacity: 4,
            dlq_max_attempts: 2,
            dlq_backoff_base_ms: 1,
        }
    }

    fn event(tenant: &str) -> DispatchEvent {
        EventFactory::new("n1").connect_online(tenant, "alice", "phone", "", 1, None)
    }

    async fn wait_for(metrics: &MetricsRegistry, name: &str, value: u64) {
        for _ in 0..400 {
            if metrics.counter_total(name) >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn tenant_quota_is_enforced_without_blocking() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (dispatcher, _worker, _dlq) = dispatch_pipeline(
            &cfg(),
            Arc::new(ScriptedProducer::default()),
            metrics.clone(),
            ManualClock::new(),
        );
        assert!(dispatcher.try_enqueue(event("t1")));
        assert!(dispatcher.try_enqueue(event("t1")));
        assert!(!dispatcher.try_enqueue(event("t1")));
        assert!(dispatcher.try_enqueue(event("t2")));
        assert_eq!(dispatcher.pending_for("t1"), 2);
        assert_eq!(
            metrics.counter_value(
                "courier_mq_dropped_total",
                &[("tenant", "t1"), ("reason", "tenant_quota")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn release_on_fresh_counter_does_not_lock_tenant_out() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (dispatcher, _worker, _dlq) = dispatch_pipeline(
            &cfg(),
            Arc::new(ScriptedProducer::default()),
            metrics,
            ManualClock::new(),
        );
        let fresh = Arc::new(AtomicI64::new(0));
        dispatcher.pending.insert("t".to_string(), fresh.clone());
        release_pending(&dispatcher.pending, "t");
        assert_eq!(fresh.load(Ordering::Acquire), -1);
        assert_eq!(dispatcher.pending_for("t"), 0);
        assert!(dispatcher.try_enqueue(event("t")));
        assert!(dispatcher.try_enqueue(event("t")));
        assert!(!dispatcher.try_enqueue(event("t")));
    }

    #[tokio::test]
    async fn exhausted_events_land_on_dlq_topic() {
        let metrics = Arc::new(MetricsRegistry::new());
        let producer = Arc::new(ScriptedProducer {
            fail_topics: vec![event_topic("t1")],
            ..ScriptedProducer::default()
        });
        let (dispatcher, worker, dlq) =
            dispatch_pipeline(&cfg(), producer.clone(), metrics.clone(), ManualClock::new());
        let (tx, shutdown) = watch::channel(false);
        let a = tokio::spawn(worker.run(shutdown.clone()));
        let b = tokio::spawn(dlq.run(shutdown));
        assert!(dispatcher.try_enqueue(event("t1")));
        wait_for(&metrics, "courier_mq_dlq_total", 1).await;
        let _ = tx.send(true);
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(producer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*producer.produced.lock(), vec![dlq_topic("t1")]);
        assert_eq!(metrics.counter_total("courier_mq_retry_total"), 2);
        assert_eq!(dispatcher.pending_for("t1"), 0);
    }

    #[tokio::test]
    async fn dlq_failure_drops_with_metric() {
        let metrics = Arc::new(MetricsRegistry::new());
        let producer = Arc::new(ScriptedProducer {
            fail_topics: vec![event_topic("t1"), dlq_topic("t1")],
            ..ScriptedProducer::default()
        });
        let (dispatcher, worker, dlq) =
            dispatch_pipeline(&cfg(), producer.clone(), metrics.clone(), ManualClock::new());
        let (tx, shutdown) = watch::channel(false);
        let a = tokio::spawn(worker.run(shutdown.clone()));
        let b = tokio::spawn(dlq.run(shutdown));
        dispatcher.try_enqueue(event("t1"));
        wait_for(&metrics, "courier_mq_dropped_total", 1).await;
        let _ = tx.send(true);
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(
            metrics.counter_value(
                "courier_mq_dropped_total",
                &[("tenant", "t1"), ("reason", "dlq_failed")]
            ),
            1
        );
        assert_eq!(producer.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let publisher = Publisher {
            producer: Arc::new(ScriptedProducer::default()),
            metrics: Arc::new(MetricsRegistry::new()),
            clock: ManualClock::new(),
            max_attempts: 10,
            backoff_base: Duration::from_millis(50),
            topic_kind: "event",
        };
        assert_eq!(publisher.backoff(1), Duration::from_millis(50));
        assert_eq!(publisher.backoff(3), Duration::from_millis(200));
        assert_eq!(publisher.backoff(10), MAX_BACKOFF);
    }
}
