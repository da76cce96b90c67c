//! Device session: the single serialized Modbus TCP connection.
//!
//! All reads and writes from HTTP handlers and telemetry samplers funnel
//! through one `DeviceSession`. A tokio mutex over the cached transport is
//! the single serialization point, so two wire operations never interleave
//! on the shared socket. The socket is lazily (re)connected on every
//! operation; a stale connection self-heals on the next call.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{error, warn};

use crate::config::{AddressSpace, DeviceConfig};
use crate::error::{Result, ServientError};
use crate::modbus::address::{self, AccessForm, RegisterClass, RegisterTarget};

/// Value read from the device. A single-element result collapses to a
/// scalar; multi-register reads return the values in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl PropertyValue {
    fn from_readings(mut readings: Vec<f64>) -> Self {
        if readings.len() == 1 {
            PropertyValue::Scalar(readings.remove(0))
        } else {
            PropertyValue::Vector(readings)
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            PropertyValue::Scalar(v) => Some(*v),
            PropertyValue::Vector(_) => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Scalar(v) => write!(f, "{v}"),
            PropertyValue::Vector(vs) => write!(f, "{vs:?}"),
        }
    }
}

/// Outcome of one register write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOutcome {
    pub class: RegisterClass,
    pub wire_address: u16,
    pub value: i64,
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wrote {} to {} @{}", self.value, self.class, self.wire_address)
    }
}

/// Wire-level transport seam. Production uses `tokio-modbus` over TCP;
/// tests inject doubles.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>>;
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;
    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()>;
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;
    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()>;
}

/// `tokio-modbus` TCP client behind the transport seam.
struct TcpTransport {
    ctx: Context,
    timeout: Duration,
}

impl TcpTransport {
    async fn connect(addr: SocketAddr, unit_id: u8, timeout: Duration) -> Result<Self> {
        let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(unit_id)))
            .await
            .map_err(|_| ServientError::connection(format!("connect to {addr} timed out")))?
            .map_err(|e| ServientError::connection(format!("connect to {addr} failed: {e}")))?;
        Ok(Self { ctx, timeout })
    }

}

/// Flattens the doubled `tokio-modbus` result: the outer error is a
/// transport failure, the inner one a Modbus exception frame.
macro_rules! timed_call {
    ($timeout:expr, $fut:expr) => {
        match tokio::time::timeout($timeout, $fut).await {
            Err(_) => Err(ServientError::connection("modbus operation timed out")),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(Err(code))) => Err(code.into()),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    };
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>> {
        timed_call!(self.timeout, self.ctx.read_coils(address, count))
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        timed_call!(self.timeout, self.ctx.read_holding_registers(address, count))
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        timed_call!(self.timeout, self.ctx.write_single_coil(address, value))
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        timed_call!(self.timeout, self.ctx.write_single_register(address, value))
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        timed_call!(self.timeout, self.ctx.write_multiple_registers(address, values))
    }
}

/// Factory producing a fresh transport on (re)connect.
pub type TransportFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn ModbusTransport>>> + Send + Sync>;

/// The single serialized session against one PLC endpoint.
pub struct DeviceSession {
    factory: TransportFactory,
    transport: Mutex<Option<Box<dyn ModbusTransport>>>,
    connected: AtomicBool,
    endpoint: String,
}

impl DeviceSession {
    /// Builds a session connecting to the configured device endpoint.
    pub fn from_config(device: &DeviceConfig) -> Result<Self> {
        let host = device.host()?;
        let port = device.port()?;
        let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
            ServientError::config(format!("invalid device endpoint {host}:{port}: {e}"))
        })?;
        let unit_id = device.unit_id;
        let timeout = device.timeout();

        let factory: TransportFactory = Box::new(move || {
            Box::pin(async move {
                let transport = TcpTransport::connect(addr, unit_id, timeout).await?;
                Ok(Box::new(transport) as Box<dyn ModbusTransport>)
            })
        });

        Ok(Self::with_factory(factory, format!("{host}:{port}")))
    }

    /// Session over an arbitrary transport factory. Test seam.
    pub fn with_factory(factory: TransportFactory, endpoint: String) -> Self {
        Self {
            factory,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
            endpoint,
        }
    }

    /// Whether a transport is currently cached. Drives the 503 check on the
    /// HTTP surface; the next operation may still reconnect.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Reads the property addressed by `form`, applying the class scale.
    pub async fn read(&self, form: &AccessForm, space: &AddressSpace) -> Result<PropertyValue> {
        let targets = address::targets(form, space)?;

        let mut guard = self.transport.lock().await;
        self.ensure_connected(&mut guard).await?;

        let mut readings = Vec::with_capacity(targets.len());
        for target in &targets {
            let Some(transport) = guard.as_mut() else {
                return Err(ServientError::internal("transport missing after connect"));
            };
            match Self::read_target(transport.as_mut(), target).await {
                Ok(value) => readings.push(value),
                Err(e) => {
                    // Partial results are discarded; a mid-loop failure
                    // aborts the whole call.
                    self.handle_failure(&mut guard, &e);
                    error!(href = %form.href, error = %e, "read failed");
                    return Err(e);
                },
            }
        }
        Ok(PropertyValue::from_readings(readings))
    }

    /// Writes `value` to every register the form expands to. Values are
    /// written as already-scaled raw integers; no inverse scale is applied.
    pub async fn write(
        &self,
        form: &AccessForm,
        space: &AddressSpace,
        value: i64,
    ) -> Result<Vec<WriteOutcome>> {
        let targets = address::targets(form, space)?;

        let mut guard = self.transport.lock().await;
        self.ensure_connected(&mut guard).await?;

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in &targets {
            let Some(transport) = guard.as_mut() else {
                return Err(ServientError::internal("transport missing after connect"));
            };
            match Self::write_target(transport.as_mut(), target, value).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    self.handle_failure(&mut guard, &e);
                    error!(href = %form.href, value, error = %e, "write failed");
                    return Err(e);
                },
            }
        }
        Ok(outcomes)
    }

    async fn ensure_connected(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<Box<dyn ModbusTransport>>>,
    ) -> Result<()> {
        if guard.is_none() {
            match (self.factory)().await {
                Ok(transport) => {
                    **guard = Some(transport);
                    self.connected.store(true, Ordering::Relaxed);
                },
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "unable to connect to device");
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(e);
                },
            }
        }
        Ok(())
    }

    /// A transport-level failure invalidates the cached connection so the
    /// next call reconnects. Exception frames keep the socket.
    fn handle_failure(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<Box<dyn ModbusTransport>>>,
        error: &ServientError,
    ) {
        if matches!(error, ServientError::ConnectionError(_)) {
            **guard = None;
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    async fn read_target(transport: &mut dyn ModbusTransport, target: &RegisterTarget) -> Result<f64> {
        match target.class {
            RegisterClass::Coil => {
                let bits = transport.read_coils(target.wire_address, 1).await?;
                let bit = bits.first().copied().ok_or_else(|| {
                    ServientError::protocol(format!("empty coil response @{}", target.wire_address))
                })?;
                Ok(if bit { 1.0 } else { 0.0 })
            },
            RegisterClass::SingleWord => {
                let regs = transport.read_holding_registers(target.wire_address, 1).await?;
                let raw = regs.first().copied().ok_or_else(|| {
                    ServientError::protocol(format!(
                        "empty register response @{}",
                        target.wire_address
                    ))
                })?;
                Ok(f64::from(decode_single_word(raw)) * target.scale)
            },
            RegisterClass::DoubleWord => {
                let regs = transport.read_holding_registers(target.wire_address, 2).await?;
                if regs.len() < 2 {
                    return Err(ServientError::protocol(format!(
                        "short double-word response @{}",
                        target.wire_address
                    )));
                }
                Ok(f64::from(decode_double_word(regs[0], regs[1])) * target.scale)
            },
        }
    }

    async fn write_target(
        transport: &mut dyn ModbusTransport,
        target: &RegisterTarget,
        value: i64,
    ) -> Result<WriteOutcome> {
        match target.class {
            RegisterClass::Coil => {
                transport.write_single_coil(target.wire_address, value != 0).await?;
            },
            RegisterClass::SingleWord => {
                // Accept the unsigned and the two's-complement signed range;
                // anything wider would truncate on the wire.
                let raw = u16::try_from(value)
                    .or_else(|_| i16::try_from(value).map(|v| v as u16))
                    .map_err(|_| {
                        ServientError::validation(format!(
                            "value {value} does not fit a single word register"
                        ))
                    })?;
                transport.write_single_register(target.wire_address, raw).await?;
            },
            RegisterClass::DoubleWord => {
                let raw = u32::try_from(value)
                    .or_else(|_| i32::try_from(value).map(|v| v as u32))
                    .map_err(|_| {
                        ServientError::validation(format!(
                            "value {value} does not fit a double word register pair"
                        ))
                    })?;
                transport
                    .write_multiple_registers(target.wire_address, &encode_double_word(raw))
                    .await?;
            },
        }
        Ok(WriteOutcome {
            class: target.class,
            wire_address: target.wire_address,
            value,
        })
    }
}

/// 16-bit registers decode as signed big-endian words.
fn decode_single_word(raw: u16) -> i16 {
    raw as i16
}

/// 32-bit values span a register pair in little-endian word order: the first
/// register carries the low word. Matches the device family convention.
fn decode_double_word(low: u16, high: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

fn encode_double_word(raw: u32) -> [u16; 2] {
    [(raw & 0xFFFF) as u16, (raw >> 16) as u16]
}
