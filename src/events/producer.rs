use crate::config::ProducerKind;
use async_trait::async_trait;
use std::sync::Arc;

/// Event bus client. `produce` reports whether the bus accepted the record.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn produce(&self, topic: &str, key: &[u8], value: &[u8]) -> bool;
}

/// Used when no bus is configured; accepts and discards everything.
#[derive(Debug, Default)]
pub struct NoopProducer;

#[async_trait]
impl EventProducer for NoopProducer {
    async fn produce(&self, _topic: &str, _key: &[u8], _value: &[u8]) -> bool {
        true
    }
}

/// Writes each record as a structured log line.
#[derive(Debug, Default)]
pub struct LogProducer;

#[async_trait]
impl EventProducer for LogProducer {
    async fn produce(&self, topic: &str, key: &[u8], value: &[u8]) -> bool {
        tracing::info!(
            topic,
            key = %String::from_utf8_lossy(key),
            bytes = value.len(),
            "event produced"
        );
        true
    }
}

pub fn build_producer(kind: ProducerKind) -> Arc<dyn EventProducer> {
    match kind {
        ProducerKind::Noop => Arc::new(NoopProducer),
        ProducerKind::Log => Arc::new(LogProducer),
    }
}
