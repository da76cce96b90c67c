//! Telemetry: metric pipelines, the observation scheduler, and the
//! reachability monitor that gates the scheduler on device health.

pub mod meter;
pub mod scheduler;

pub use meter::MeterStack;
pub use scheduler::TelemetryScheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServientConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::modbus::DeviceSession;

/// TCP probe timeout for one reachability check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Gates the observation scheduler on device reachability.
///
/// Each readiness probe opens a throwaway TCP connection to the device. The
/// first successful probe after a period of unreachability starts the
/// scheduler; the first failed probe after a reachable period tears it down,
/// so instruments are never registered twice and nothing samples a dead
/// device.
pub struct ReachabilityMonitor {
    config: Arc<ServientConfig>,
    session: Arc<DeviceSession>,
    bus: Arc<EventBus>,
    endpoint: String,
    reachable: AtomicBool,
    scheduler: Mutex<Option<TelemetryScheduler>>,
}

impl ReachabilityMonitor {
    pub fn new(
        config: Arc<ServientConfig>,
        session: Arc<DeviceSession>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let endpoint = format!("{}:{}", config.device.host()?, config.device.port()?);
        Ok(Self {
            config,
            session,
            bus,
            endpoint,
            reachable: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        })
    }

    /// Probes the device and reconciles the scheduler with the outcome.
    /// Returns whether the device is reachable. Only the readiness probe
    /// calls this; the data path consults [`Self::is_reachable`] instead.
    pub async fn check(&self) -> bool {
        let reachable = self.probe().await;
        self.reachable.store(reachable, Ordering::Relaxed);
        let mut scheduler = self.scheduler.lock().await;
        match (reachable, scheduler.is_some()) {
            (true, false) => {
                info!(endpoint = %self.endpoint, "device reachable, starting telemetry");
                match TelemetryScheduler::start(
                    &self.config,
                    self.session.clone(),
                    self.bus.clone(),
                ) {
                    Ok(started) => *scheduler = Some(started),
                    Err(e) => warn!(error = %e, "failed to start telemetry scheduler"),
                }
            },
            (false, true) => {
                warn!(endpoint = %self.endpoint, "device unreachable, stopping telemetry");
                if let Some(running) = scheduler.take() {
                    running.shutdown().await;
                }
            },
            // Steady state either way.
            _ => {},
        }
        reachable
    }

    /// Outcome of the most recent readiness probe. Side-effect free: reading
    /// it never probes the device or touches the scheduler.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&self.endpoint)).await,
            Ok(Ok(_))
        )
    }

    /// Records a Modbus round-trip on the latency histogram, if telemetry is
    /// running.
    pub async fn record_latency(&self, op: &str, millis: f64) {
        if let Some(scheduler) = self.scheduler.lock().await.as_ref() {
            scheduler.record_latency(op, millis);
        }
    }

    pub async fn is_observing(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    /// Stops the scheduler if it is running.
    pub async fn shutdown(&self) {
        if let Some(running) = self.scheduler.lock().await.take() {
            running.shutdown().await;
        }
    }
}
