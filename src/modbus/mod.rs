//! Modbus device access: declarative-form address resolution and the
//! serialized TCP session against the physical device.

pub mod address;
pub mod session;

pub use address::{AccessForm, Operation, RegisterClass, RegisterTarget};
pub use session::{DeviceSession, ModbusTransport, PropertyValue, WriteOutcome};
