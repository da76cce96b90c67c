//! Observation scheduler.
//!
//! Groups the observable properties of the device description by polling
//! interval and runs one sampler task per interval. Every sample is recorded
//! on the interval's gauge pipeline and fanned out on the event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::metrics::Gauge;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AddressSpace, ServientConfig};
use crate::error::Result;
use crate::events::{EventBus, PropertyEvent};
use crate::modbus::address::{AccessForm, Operation};
use crate::modbus::DeviceSession;
use crate::telemetry::meter::MeterStack;

/// One observable property bound to its interval pipeline.
struct SampledProperty {
    name: String,
    form: AccessForm,
    gauge: Gauge<f64>,
}

/// Running sampler tasks plus their metric pipelines.
pub struct TelemetryScheduler {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    meters: Arc<MeterStack>,
}

impl TelemetryScheduler {
    /// Builds the metric pipelines and spawns one sampler per distinct
    /// polling interval.
    pub fn start(
        config: &ServientConfig,
        session: Arc<DeviceSession>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let default_interval = config.telemetry.default_polling_time;
        let device = &config.device.name;

        let mut groups: HashMap<u64, Vec<(String, AccessForm, Option<String>)>> = HashMap::new();
        for (name, property) in &config.device.spec.properties {
            let form = property.form();
            if !form.allows(Operation::ObserveProperty) {
                continue;
            }
            let interval = form.polling_time.unwrap_or(default_interval);
            groups.entry(interval).or_default().push((
                name.clone(),
                form.clone(),
                property.unit.clone(),
            ));
        }

        // The service-level instruments need a pipeline even when nothing is
        // observable.
        let mut intervals: Vec<u64> = groups.keys().copied().collect();
        if intervals.is_empty() {
            intervals.push(default_interval);
        }
        let meters = Arc::new(MeterStack::new(
            &config.telemetry,
            &config.kubernetes,
            device,
            &intervals,
        )?);

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        for (interval, entries) in groups {
            let mut sampled = Vec::with_capacity(entries.len());
            for (name, form, unit) in entries {
                let gauge = meters.gauge(interval, &format!("{device}.{name}"), unit.as_deref())?;
                sampled.push(SampledProperty { name, form, gauge });
            }
            info!(
                interval_seconds = interval,
                properties = sampled.len(),
                "starting sampler"
            );
            tasks.push(tokio::spawn(sample_loop(
                interval,
                sampled,
                config.address_space.clone(),
                session.clone(),
                bus.clone(),
                meters.clone(),
                shutdown.clone(),
            )));
        }

        Ok(Self { shutdown, tasks, meters })
    }

    pub fn record_latency(&self, op: &str, millis: f64) {
        self.meters.record_latency(op, millis);
    }

    /// Stops the samplers and flushes the metric pipelines.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.meters.shutdown();
        info!("telemetry scheduler stopped");
    }
}

async fn sample_loop(
    interval_seconds: u64,
    entries: Vec<SampledProperty>,
    space: AddressSpace,
    session: Arc<DeviceSession>,
    bus: Arc<EventBus>,
    meters: Arc<MeterStack>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {},
        }

        for entry in &entries {
            let started = Instant::now();
            match session.read(&entry.form, &space).await {
                Ok(value) => {
                    meters.record_latency("read", started.elapsed().as_secs_f64() * 1_000.0);
                    if let Some(scalar) = value.as_scalar() {
                        entry.gauge.record(scalar, &[]);
                    }
                    bus.publish(PropertyEvent {
                        name: entry.name.clone(),
                        value,
                        timestamp: Utc::now().timestamp_millis(),
                    });
                },
                Err(e) => {
                    warn!(property = %entry.name, error = %e, "sample failed");
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, DeviceConfig, DeviceSpec, KafkaConfig, KubernetesConfig, MetricsExporter,
        TelemetryConfig,
    };
    use crate::error::ServientError;
    use crate::modbus::session::{ModbusTransport, TransportFactory};
    use crate::modbus::PropertyValue;
    use async_trait::async_trait;

    struct StaticDevice {
        holding: u16,
    }

    #[async_trait]
    impl ModbusTransport for StaticDevice {
        async fn read_coils(&mut self, _addr: u16, count: u16) -> crate::error::Result<Vec<bool>> {
            Ok(vec![false; count as usize])
        }

        async fn read_holding_registers(
            &mut self,
            _addr: u16,
            count: u16,
        ) -> crate::error::Result<Vec<u16>> {
            Ok(vec![self.holding; count as usize])
        }

        async fn write_single_coil(&mut self, _addr: u16, _value: bool) -> crate::error::Result<()> {
            Err(ServientError::protocol("read-only device"))
        }

        async fn write_single_register(
            &mut self,
            _addr: u16,
            _value: u16,
        ) -> crate::error::Result<()> {
            Err(ServientError::protocol("read-only device"))
        }

        async fn write_multiple_registers(
            &mut self,
            _addr: u16,
            _values: &[u16],
        ) -> crate::error::Result<()> {
            Err(ServientError::protocol("read-only device"))
        }
    }

    fn static_factory(holding: u16) -> TransportFactory {
        Box::new(move || {
            Box::pin(async move {
                Ok(Box::new(StaticDevice { holding }) as Box<dyn ModbusTransport>)
            })
        })
    }

    fn observable_config() -> ServientConfig {
        let spec: DeviceSpec = serde_json::from_value(serde_json::json!({
            "version": "1.0.0",
            "properties": {
                "temp": {
                    "unit": "celsius",
                    "forms": [{
                        "href": "modbus+tcp://10.0.9.40:502/1/400701",
                        "modbus:entity": "HoldingRegister",
                        "op": ["readproperty", "observeproperty"],
                        "modbus:pollingTime": 1,
                        "scale": 0.1
                    }]
                }
            }
        }))
        .unwrap();
        ServientConfig {
            device: DeviceConfig {
                name: "mccp".to_string(),
                base: "modbus+tcp://10.0.9.40:502/1/".to_string(),
                timeout_ms: 1_000,
                unit_id: 1,
                spec,
            },
            address_space: AddressSpace::default(),
            api: ApiConfig::default(),
            kafka: KafkaConfig::default(),
            telemetry: TelemetryConfig {
                exporter: MetricsExporter::Stdout,
                ..TelemetryConfig::default()
            },
            kubernetes: KubernetesConfig::default(),
        }
    }

    /// `recv()` may time out between samples; retry a bounded number of
    /// attempts before failing.
    async fn next_event(subscription: &mut crate::events::Subscription) -> PropertyEvent {
        for _ in 0..10 {
            if let Some(event) = subscription.recv().await {
                return event;
            }
        }
        panic!("no sample arrived within ten receive attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn samples_flow_onto_the_event_bus() {
        let config = observable_config();
        let session = Arc::new(DeviceSession::with_factory(
            static_factory(215),
            "10.0.9.40:502".to_string(),
        ));
        let bus = Arc::new(EventBus::new());
        let mut subscription = bus.subscribe(bus.next_subscriber_id()).unwrap();

        let scheduler = TelemetryScheduler::start(&config, session, bus.clone()).unwrap();

        let event = next_event(&mut subscription).await;
        assert_eq!(event.name, "temp");
        assert_eq!(event.value, PropertyValue::Scalar(21.5));
        assert!(event.timestamp > 0);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resamples_on_every_interval() {
        let config = observable_config();
        let session = Arc::new(DeviceSession::with_factory(
            static_factory(100),
            "10.0.9.40:502".to_string(),
        ));
        let bus = Arc::new(EventBus::new());
        let mut subscription = bus.subscribe(bus.next_subscriber_id()).unwrap();

        let scheduler = TelemetryScheduler::start(&config, session, bus.clone()).unwrap();

        for _ in 0..3 {
            let event = next_event(&mut subscription).await;
            assert_eq!(event.value, PropertyValue::Scalar(10.0));
        }

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn starts_without_observable_properties() {
        let mut config = observable_config();
        config.device.spec.properties.clear();
        let session = Arc::new(DeviceSession::with_factory(
            static_factory(0),
            "10.0.9.40:502".to_string(),
        ));
        let bus = Arc::new(EventBus::new());

        let scheduler = TelemetryScheduler::start(&config, session, bus).unwrap();
        scheduler.record_latency("read", 4.2);
        scheduler.shutdown().await;
    }
}
