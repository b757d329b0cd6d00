//! Outbound event pipeline: per-tenant bounded enqueue, retrying publish to
//! the tenant topic, then a separately bounded DLQ fallback.

pub mod dispatcher;
pub mod event;
pub mod producer;

pub use dispatcher::{dispatch_pipeline, DispatchWorker, DlqWorker, EventDispatcher};
pub use event::{dlq_topic, event_topic, DispatchEvent, EventFactory, EventType};
pub use producer::{build_producer, EventProducer, LogProducer, NoopProducer};
