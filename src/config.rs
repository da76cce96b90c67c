//! Servient configuration.
//!
//! Layered with figment: built-in defaults, then an optional YAML file, then
//! `PLC_`-prefixed environment variables. The device description itself is
//! JSON (inline in the file or injected through the `DEVICE_SPEC` environment
//! variable) and is validated into typed structs at startup so malformed
//! specs are rejected before the first request.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ServientError};
use crate::modbus::address::{self, AccessForm, Operation};

/// Environment variable carrying the device description as a JSON document.
pub const DEVICE_SPEC_ENV: &str = "DEVICE_SPEC";

/// Top-level servient configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServientConfig {
    pub device: DeviceConfig,

    #[serde(default)]
    pub address_space: AddressSpace,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

/// The consumed PLC device: identity, endpoint and declarative description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, used as the metrics service name and instrument prefix
    pub name: String,

    /// Base URI, e.g. `modbus+tcp://10.0.9.40:502/1/`
    pub base: String,

    /// Socket timeout for Modbus operations, milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Modbus unit (slave) identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[serde(default)]
    pub spec: DeviceSpec,
}

impl DeviceConfig {
    /// Host part of the base URI.
    pub fn host(&self) -> Result<String> {
        let rest = self
            .base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base);
        let authority = rest.split('/').next().unwrap_or(rest);
        let host = authority.split(':').next().unwrap_or("");
        if host.is_empty() {
            return Err(ServientError::config(format!(
                "cannot parse host from base URI '{}'",
                self.base
            )));
        }
        Ok(host.to_string())
    }

    /// Port part of the base URI.
    pub fn port(&self) -> Result<u16> {
        let rest = self
            .base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority
            .split_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| {
                ServientError::config(format!("cannot parse port from base URI '{}'", self.base))
            })
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Declarative device description (WoT-style thing description subset).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default = "default_spec_version")]
    pub version: String,

    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

impl DeviceSpec {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Names of all properties declaring `observeproperty`.
    pub fn observable_properties(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|(_, p)| p.form().allows(Operation::ObserveProperty))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Distinct polling intervals among observable properties, in seconds.
    pub fn polling_times(&self, default_seconds: u64) -> BTreeSet<u64> {
        self.properties
            .values()
            .filter(|p| p.form().allows(Operation::ObserveProperty))
            .map(|p| p.form().polling_time.unwrap_or(default_seconds))
            .collect()
    }
}

/// One device property with its access forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    pub forms: Vec<AccessForm>,
}

impl Property {
    /// The binding form. The description format allows several; this servient
    /// follows the first, matching the original device family descriptions.
    pub fn form(&self) -> &AccessForm {
        &self.forms[0]
    }
}

/// Inclusive logical register range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    pub start: u32,
    pub end: u32,
}

impl RegisterRange {
    pub fn contains(&self, register: u32) -> bool {
        self.start <= register && register <= self.end
    }
}

/// Register table names and class ranges of the device family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSpace {
    #[serde(default = "default_coil_table")]
    pub coil_table: String,

    #[serde(default = "default_holding_register_table")]
    pub holding_register_table: String,

    #[serde(default = "default_single_word_range")]
    pub single_word: RegisterRange,

    #[serde(default = "default_double_word_range")]
    pub double_word: RegisterRange,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self {
            coil_table: default_coil_table(),
            holding_register_table: default_holding_register_table(),
            single_word: default_single_word_range(),
            double_word: default_double_word_range(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: default_api_host(), port: default_api_port() }
    }
}

/// Kafka write-event sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// When disabled, write events are logged and dropped (development mode)
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_kafka_brokers")]
    pub brokers: String,

    #[serde(default = "default_events_topic")]
    pub events_topic: String,

    #[serde(default = "default_max_block_ms")]
    pub max_block_ms: u64,

    #[serde(default = "default_kafka_retries")]
    pub retries: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            brokers: default_kafka_brokers(),
            events_topic: default_events_topic(),
            max_block_ms: default_max_block_ms(),
            retries: default_kafka_retries(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub exporter: MetricsExporter,

    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Interval assigned to observable properties without an explicit
    /// `modbus:pollingTime`, seconds
    #[serde(default = "default_polling_time")]
    pub default_polling_time: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            exporter: MetricsExporter::default(),
            otlp_endpoint: default_otlp_endpoint(),
            default_polling_time: default_polling_time(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsExporter {
    #[default]
    Otlp,
    /// Console exporter for development and debugging
    Stdout,
}

/// Kubernetes attributes of the pod running this servient, attached to the
/// metrics resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub pod_uid: String,

    #[serde(default)]
    pub pod_name: String,

    #[serde(default)]
    pub namespace: String,
}

impl ServientConfig {
    /// Loads configuration: defaults, optional YAML file, `PLC_` environment
    /// variables, and the `DEVICE_SPEC` JSON document.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(serde_json::json!({
                "device": { "name": "plc", "base": "modbus+tcp://127.0.0.1:502/1/" }
            })));

        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }

        figment = figment.merge(Env::prefixed("PLC_").split("__"));

        if let Ok(raw) = std::env::var(DEVICE_SPEC_ENV) {
            let spec: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                ServientError::config(format!("{DEVICE_SPEC_ENV} is not valid JSON: {e}"))
            })?;
            figment = figment.merge(Serialized::defaults(serde_json::json!({
                "device": { "spec": spec }
            })));
        }

        let config: ServientConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects malformed device descriptions at startup rather than
    /// per-request.
    pub fn validate(&self) -> Result<()> {
        let host = self.device.host()?;
        let port = self.device.port()?;

        for (name, property) in &self.device.spec.properties {
            if property.forms.is_empty() {
                return Err(ServientError::config(format!(
                    "property '{name}' declares no forms"
                )));
            }
            let form = property.form();
            if form.op.is_empty() {
                return Err(ServientError::config(format!(
                    "property '{name}' declares no operations"
                )));
            }
            // Every declared form must resolve against the configured
            // address space, including its full quantity expansion.
            address::targets(form, &self.address_space).map_err(|e| {
                ServientError::config(format!("property '{name}': {e}"))
            })?;
        }

        info!(
            device = %self.device.name,
            endpoint = %format!("{host}:{port}"),
            properties = self.device.spec.properties.len(),
            "device description validated"
        );
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_unit_id() -> u8 {
    1
}

fn default_spec_version() -> String {
    "1.0.0".to_string()
}

fn default_coil_table() -> String {
    "Coil".to_string()
}

fn default_holding_register_table() -> String {
    "HoldingRegister".to_string()
}

fn default_single_word_range() -> RegisterRange {
    RegisterRange { start: 400_001, end: 404_500 }
}

fn default_double_word_range() -> RegisterRange {
    RegisterRange { start: 416_385, end: 418_383 }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_events_topic() -> String {
    "plc.events".to_string()
}

fn default_max_block_ms() -> u64 {
    5_000
}

fn default_kafka_retries() -> u32 {
    5
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_polling_time() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> DeviceSpec {
        serde_json::from_value(serde_json::json!({
            "version": "1.0.0",
            "properties": {
                "temp": {
                    "unit": "celsius",
                    "forms": [{
                        "href": "modbus+tcp://10.0.9.40:502/1/400701",
                        "modbus:entity": "HoldingRegister",
                        "op": ["readproperty", "observeproperty"],
                        "modbus:pollingTime": 5,
                        "scale": 0.1
                    }]
                },
                "feeder": {
                    "forms": [{
                        "href": "modbus+tcp://10.0.9.40:502/1/5",
                        "modbus:entity": "Coil",
                        "op": ["readproperty", "writeproperty"]
                    }]
                }
            }
        }))
        .unwrap()
    }

    fn sample_config() -> ServientConfig {
        ServientConfig {
            device: DeviceConfig {
                name: "mccp".to_string(),
                base: "modbus+tcp://10.0.9.40:502/1/".to_string(),
                timeout_ms: 1_000,
                unit_id: 1,
                spec: sample_spec(),
            },
            address_space: AddressSpace::default(),
            api: ApiConfig::default(),
            kafka: KafkaConfig::default(),
            telemetry: TelemetryConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }

    #[test]
    fn parses_host_and_port_from_base_uri() {
        let config = sample_config();
        assert_eq!(config.device.host().unwrap(), "10.0.9.40");
        assert_eq!(config.device.port().unwrap(), 502);
    }

    #[test]
    fn rejects_base_uri_without_port() {
        let mut config = sample_config();
        config.device.base = "modbus+tcp://10.0.9.40/1/".to_string();
        assert!(config.device.port().is_err());
    }

    #[test]
    fn valid_description_passes_validation() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn unresolvable_property_fails_validation() {
        let mut config = sample_config();
        config
            .device
            .spec
            .properties
            .get_mut("temp")
            .unwrap()
            .forms[0]
            .href = "modbus+tcp://10.0.9.40:502/1/999999".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ServientError::ConfigError(_)));
    }

    #[test]
    fn loads_yaml_file_over_defaults() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
device:
  name: mccp
  base: "modbus+tcp://10.0.9.40:502/1/"
api:
  port: 8080
kafka:
  enabled: false
"#
        )
        .unwrap();

        let config = ServientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.device.name, "mccp");
        assert_eq!(config.api.port, 8080);
        assert!(!config.kafka.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(config.telemetry.default_polling_time, 30);
    }

    #[test]
    fn observable_properties_and_polling_times() {
        let spec = sample_spec();
        assert_eq!(spec.observable_properties(), vec!["temp"]);
        let times = spec.polling_times(30);
        assert!(times.contains(&5));
        assert_eq!(times.len(), 1);
    }

    #[test]
    fn properties_without_polling_time_use_default() {
        let mut spec = sample_spec();
        spec.properties.get_mut("feeder").unwrap().forms[0]
            .op
            .push(Operation::ObserveProperty);
        spec.properties.get_mut("feeder").unwrap().forms[0].polling_time = None;
        let times = spec.polling_times(30);
        assert!(times.contains(&30));
        assert!(times.contains(&5));
    }
}
