//! Write-event relay: buffers successful property writes and publishes them
//! to the external broker asynchronously, so HTTP write latency is never
//! coupled to sink latency.
//!
//! The queue is bounded and non-blocking on the producer side. Relay
//! delivery is best-effort telemetry: overflow and sink failures are logged
//! and swallowed; the write itself was already acknowledged to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::error::{Result, ServientError};

/// Relay queue capacity.
const RELAY_QUEUE_CAPACITY: usize = 128;

/// How long the consumer blocks per receive attempt before re-checking the
/// shutdown token.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_TYPE: &str = "plc.write.event";
const EVENT_SOURCE: &str = "/plc/write";
const EVENT_SCHEMA: &str = "http://schema.foreveroceans.io/v1/plc/writeEvent-1.0.0.json";

/// CloudEvents-shaped envelope for one successful property write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteEvent {
    pub context: WriteEventContext,
    pub data: WriteEventData,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteEventContext {
    pub version: String,
    pub id: Uuid,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub action: String,
    pub dataschema: String,
    pub datacontenttype: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteEventData {
    pub property: String,
    pub value: i64,
}

impl WriteEvent {
    pub fn new(property: impl Into<String>, value: i64) -> Self {
        Self {
            context: WriteEventContext {
                version: "1.0.0".to_string(),
                id: Uuid::new_v4(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                event_type: EVENT_TYPE.to_string(),
                source: EVENT_SOURCE.to_string(),
                action: "update".to_string(),
                dataschema: EVENT_SCHEMA.to_string(),
                datacontenttype: "json".to_string(),
            },
            data: WriteEventData { property: property.into(), value },
        }
    }
}

/// External message sink boundary: `send(topic, payload)` with the sink's
/// own blocking/retry policy.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Kafka producer sink.
pub struct KafkaSink {
    producer: FutureProducer,
    max_block: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.max_block_ms.to_string())
            .set("retries", config.retries.to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| ServientError::sink(format!("kafka producer: {e}")))?;
        info!(brokers = %config.brokers, "kafka producer initialized");
        Ok(Self {
            producer,
            max_block: Duration::from_millis(config.max_block_ms),
        })
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let record = FutureRecord::<(), _>::to(topic).payload(&payload);
        self.producer
            .send(record, Timeout::After(self.max_block))
            .await
            .map_err(|(e, _)| ServientError::sink(format!("kafka publish: {e}")))?;
        Ok(())
    }
}

/// Development sink used when the broker is disabled: events are logged and
/// dropped.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        info!(topic, bytes = payload.len(), "event sink disabled, dropping write event");
        Ok(())
    }
}

/// Producer handle for the write-event queue.
#[derive(Clone)]
pub struct WriteEventRelay {
    tx: mpsc::Sender<WriteEvent>,
}

impl WriteEventRelay {
    /// Starts the relay consumer and returns the producer handle plus the
    /// consumer task handle for shutdown joining.
    pub fn start(
        sink: Arc<dyn EventSink>,
        topic: String,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let handle = tokio::spawn(consume(sink, topic, rx, shutdown));
        (Self { tx }, handle)
    }

    /// Enqueues a write event. Never blocks: a full queue drops the event
    /// after logging, since relay delivery is best-effort.
    pub fn notify(&self, property: &str, value: i64) {
        let event = WriteEvent::new(property, value);
        if let Err(e) = self.tx.try_send(event) {
            warn!(property, value, error = %e, "write-event queue full, dropping event");
        }
    }
}

async fn consume(
    sink: Arc<dyn EventSink>,
    topic: String,
    mut rx: mpsc::Receiver<WriteEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = tokio::time::timeout(LISTEN_TIMEOUT, rx.recv()) => match received {
                Ok(Some(event)) => event,
                // Producer side dropped: nothing more will arrive.
                Ok(None) => break,
                // Timeout: loop around and re-check the shutdown token.
                Err(_) => continue,
            },
        };

        info!(property = %event.data.property, value = event.data.value, id = %event.context.id, "relaying write event");
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = sink.send(&topic, payload).await {
                    error!(property = %event.data.property, error = %e, "failed to publish write event");
                }
            },
            Err(e) => error!(error = %e, "failed to serialize write event"),
        }
    }
    info!("write-event relay stopped");
}
