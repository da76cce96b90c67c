//! PLC servient: translates a declarative device description into a Modbus
//! TCP consumer with an HTTP property surface, server-sent observation
//! events, metric export and a Kafka write-event relay.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod modbus;
pub mod telemetry;

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServientConfig;
use crate::error::Result;
use crate::events::{EventBus, EventSink, KafkaSink, NullSink, WriteEventRelay};
use crate::modbus::address::AccessForm;
use crate::modbus::{DeviceSession, PropertyValue, WriteOutcome};
use crate::telemetry::ReachabilityMonitor;

/// Shared state behind every request handler and background task.
pub struct ServientContext {
    pub config: Arc<ServientConfig>,
    pub session: Arc<DeviceSession>,
    pub bus: Arc<EventBus>,
    pub relay: WriteEventRelay,
    pub monitor: Arc<ReachabilityMonitor>,
}

impl ServientContext {
    /// Wires up the device session, event bus, write-event relay and
    /// reachability monitor. Returns the relay consumer handle so shutdown
    /// can join it.
    pub fn initialize(
        config: ServientConfig,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let config = Arc::new(config);
        let session = Arc::new(DeviceSession::from_config(&config.device)?);
        let bus = Arc::new(EventBus::new());

        let sink: Arc<dyn EventSink> = if config.kafka.enabled {
            Arc::new(KafkaSink::new(&config.kafka)?)
        } else {
            Arc::new(NullSink)
        };
        let (relay, relay_task) =
            WriteEventRelay::start(sink, config.kafka.events_topic.clone(), shutdown);

        let monitor = Arc::new(ReachabilityMonitor::new(
            config.clone(),
            session.clone(),
            bus.clone(),
        )?);

        info!(device = %config.device.name, "servient context initialized");
        Ok((
            Arc::new(Self { config, session, bus, relay, monitor }),
            relay_task,
        ))
    }

    /// Whether the data path may reach for the device. True when the session
    /// holds a live socket or the latest readiness probe saw the device.
    /// Deliberately side-effect free: only `/readyz` drives the reachability
    /// state machine.
    pub fn device_available(&self) -> bool {
        self.session.is_connected() || self.monitor.is_reachable()
    }

    /// Reads one property through the serialized device session, profiling
    /// the round trip.
    pub async fn read_property(&self, name: &str, form: &AccessForm) -> Result<PropertyValue> {
        let started = Instant::now();
        let value = self.session.read(form, &self.config.address_space).await?;
        let millis = started.elapsed().as_secs_f64() * 1_000.0;
        self.monitor.record_latency("read", millis).await;
        info!(property = name, value = %value, elapsed_ms = millis, "property read");
        Ok(value)
    }

    /// Writes one property and enqueues the write event for the relay.
    pub async fn write_property(
        &self,
        name: &str,
        form: &AccessForm,
        value: i64,
    ) -> Result<Vec<WriteOutcome>> {
        let started = Instant::now();
        let outcomes = self
            .session
            .write(form, &self.config.address_space, value)
            .await?;
        let millis = started.elapsed().as_secs_f64() * 1_000.0;
        self.monitor.record_latency("write", millis).await;
        info!(property = name, value, elapsed_ms = millis, "property written");
        self.relay.notify(name, value);
        Ok(outcomes)
    }

    /// Writes through an ad hoc form. No write event is relayed: only
    /// declared-property writes carry a property name to publish.
    pub async fn write_form(&self, form: &AccessForm, value: i64) -> Result<Vec<WriteOutcome>> {
        let started = Instant::now();
        let outcomes = self
            .session
            .write(form, &self.config.address_space, value)
            .await?;
        let millis = started.elapsed().as_secs_f64() * 1_000.0;
        self.monitor.record_latency("write", millis).await;
        info!(href = %form.href, value, elapsed_ms = millis, "form write");
        Ok(outcomes)
    }
}
