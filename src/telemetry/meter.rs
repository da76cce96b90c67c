//! Per-interval metric pipelines.
//!
//! Each distinct polling interval gets its own `SdkMeterProvider` with a
//! `PeriodicReader` exporting at exactly that cadence, so a 5 s gauge is
//! pushed every 5 s and a 60 s gauge every 60 s instead of everything riding
//! one global export timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use opentelemetry::metrics::{Gauge, Histogram, Meter, MeterProvider, ObservableGauge};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use tracing::{info, warn};

use crate::config::{KubernetesConfig, MetricsExporter, TelemetryConfig};
use crate::error::{Result, ServientError};

const METER_SCOPE: &str = "plc-servient";

/// One metric pipeline per polling interval, plus the service-level
/// instruments carried on the slowest pipeline.
#[derive(Debug)]
pub struct MeterStack {
    providers: HashMap<u64, SdkMeterProvider>,
    meters: HashMap<u64, Meter>,
    latency: Histogram<f64>,
    _uptime: ObservableGauge<f64>,
}

impl MeterStack {
    /// Builds a provider for every interval in `intervals` (seconds).
    /// `intervals` must be non-empty.
    pub fn new(
        config: &TelemetryConfig,
        kubernetes: &KubernetesConfig,
        device_name: &str,
        intervals: &[u64],
    ) -> Result<Self> {
        let slowest = intervals.iter().copied().max().ok_or_else(|| {
            ServientError::internal("meter stack requires at least one polling interval")
        })?;

        let resource = build_resource(device_name, kubernetes);
        let mut providers = HashMap::new();
        let mut meters = HashMap::new();
        for &interval in intervals {
            let provider = build_provider(config, resource.clone(), interval)?;
            meters.insert(interval, provider.meter(METER_SCOPE));
            providers.insert(interval, provider);
        }
        info!(
            device = device_name,
            pipelines = providers.len(),
            exporter = ?config.exporter,
            "metric pipelines initialized"
        );

        // Service-level instruments ride the slowest pipeline so they do not
        // inflate the export volume of fast ones.
        let service_meter = &meters[&slowest];
        let started = Instant::now();
        let uptime = service_meter
            .f64_observable_gauge(format!("{device_name}.uptime"))
            .with_description("Seconds since the servient started")
            .with_unit("s")
            .with_callback(move |observer| {
                observer.observe(started.elapsed().as_secs_f64(), &[]);
            })
            .build();
        let latency = service_meter
            .f64_histogram(format!("{device_name}.modbus.latency"))
            .with_description("Modbus round-trip latency")
            .with_unit("ms")
            .build();

        Ok(Self { providers, meters, latency, _uptime: uptime })
    }

    /// Creates a gauge on the pipeline matching `interval`.
    pub fn gauge(&self, interval: u64, name: &str, unit: Option<&str>) -> Result<Gauge<f64>> {
        let meter = self.meters.get(&interval).ok_or_else(|| {
            ServientError::internal(format!("no metric pipeline for interval {interval}s"))
        })?;
        let mut builder = meter.f64_gauge(name.to_string());
        if let Some(unit) = unit {
            builder = builder.with_unit(unit.to_string());
        }
        Ok(builder.build())
    }

    /// Records one Modbus round-trip, tagged with the operation kind.
    pub fn record_latency(&self, op: &str, millis: f64) {
        self.latency.record(millis, &[KeyValue::new("op", op.to_string())]);
    }

    /// Flushes and shuts down every pipeline.
    pub fn shutdown(&self) {
        for (interval, provider) in &self.providers {
            if let Err(e) = provider.shutdown() {
                warn!(interval = *interval, error = %e, "metric pipeline shutdown failed");
            }
        }
    }
}

fn build_resource(device_name: &str, kubernetes: &KubernetesConfig) -> Resource {
    let mut attributes = Vec::new();
    if !kubernetes.pod_uid.is_empty() {
        attributes.push(KeyValue::new("k8s.pod.uid", kubernetes.pod_uid.clone()));
    }
    if !kubernetes.pod_name.is_empty() {
        attributes.push(KeyValue::new("k8s.pod.name", kubernetes.pod_name.clone()));
    }
    if !kubernetes.namespace.is_empty() {
        attributes.push(KeyValue::new(
            "k8s.namespace.name",
            kubernetes.namespace.clone(),
        ));
    }
    Resource::builder()
        .with_service_name(device_name.to_string())
        .with_attributes(attributes)
        .build()
}

fn build_provider(
    config: &TelemetryConfig,
    resource: Resource,
    interval: u64,
) -> Result<SdkMeterProvider> {
    let export_interval = Duration::from_secs(interval);
    let provider = match config.exporter {
        MetricsExporter::Otlp => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&config.otlp_endpoint)
                .build()
                .map_err(|e| ServientError::internal(format!("otlp exporter: {e}")))?;
            SdkMeterProvider::builder()
                .with_reader(
                    PeriodicReader::builder(exporter)
                        .with_interval(export_interval)
                        .build(),
                )
                .with_resource(resource)
                .build()
        },
        MetricsExporter::Stdout => {
            let exporter = opentelemetry_stdout::MetricExporter::default();
            SdkMeterProvider::builder()
                .with_reader(
                    PeriodicReader::builder(exporter)
                        .with_interval(export_interval)
                        .build(),
                )
                .with_resource(resource)
                .build()
        },
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout_config() -> TelemetryConfig {
        TelemetryConfig {
            exporter: MetricsExporter::Stdout,
            ..TelemetryConfig::default()
        }
    }

    #[tokio::test]
    async fn builds_one_pipeline_per_interval() {
        let stack = MeterStack::new(
            &stdout_config(),
            &KubernetesConfig::default(),
            "mccp",
            &[5, 30],
        )
        .unwrap();

        assert!(stack.gauge(5, "mccp.temp", Some("celsius")).is_ok());
        assert!(stack.gauge(30, "mccp.level", None).is_ok());
        stack.shutdown();
    }

    #[tokio::test]
    async fn rejects_unknown_interval() {
        let stack = MeterStack::new(
            &stdout_config(),
            &KubernetesConfig::default(),
            "mccp",
            &[5],
        )
        .unwrap();

        let err = stack.gauge(60, "mccp.temp", None).unwrap_err();
        assert!(matches!(err, ServientError::InternalError(_)));
        stack.shutdown();
    }

    #[test]
    fn requires_at_least_one_interval() {
        let err = MeterStack::new(
            &stdout_config(),
            &KubernetesConfig::default(),
            "mccp",
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ServientError::InternalError(_)));
    }

    #[tokio::test]
    async fn latency_histogram_accepts_samples() {
        let stack = MeterStack::new(
            &stdout_config(),
            &KubernetesConfig::default(),
            "mccp",
            &[30],
        )
        .unwrap();
        stack.record_latency("read", 12.5);
        stack.record_latency("write", 3.0);
        stack.shutdown();
    }
}
