use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use strum::{Display, EnumString};

use crate::protocol::modbus::{FieldMap, ModbusProto, DEFAULT_UNIT_ID};

pub const DEFAULT_CONFIG_PATH: &str = "./appconfig.json";

/// Wire transport for a listener or a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TransportKind {
    #[serde(rename = "tcp")]
    #[strum(serialize = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    #[strum(serialize = "udp")]
    Udp,
    #[serde(rename = "serial-rtu")]
    #[strum(serialize = "serial-rtu")]
    SerialRtu,
    #[serde(rename = "serial-ascii")]
    #[strum(serialize = "serial-ascii")]
    SerialAscii,
}

impl TransportKind {
    /// Framing used on the wire.
    pub fn proto(self) -> ModbusProto {
        match self {
            Self::Tcp | Self::Udp => ModbusProto::TcpUdp,
            Self::SerialRtu => ModbusProto::Rtu,
            Self::SerialAscii => ModbusProto::Ascii,
        }
    }
}

/// How a master request is polled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RequestType {
    #[default]
    ReadMultiple,
    ReadSingle,
    ReadWrite,
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub slave: Option<SlaveConfig>,
    #[serde(default)]
    pub master: Option<MasterConfig>,
    /// Same as `--debug`
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Log every inbound message
    #[serde(default)]
    pub debug: bool,
}

/// Host and port of a TCP/UDP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    #[serde(default = "default_socket_host")]
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortOptions {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    #[serde(rename = "type")]
    pub transport: TransportKind,
    #[serde(rename = "serverOptions", default)]
    pub server_options: Option<SocketOptions>,
    #[serde(rename = "serialPortOptions", default)]
    pub serial_port_options: Option<SerialPortOptions>,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Response delay in milliseconds
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub addressingoffset: i64,
    #[serde(default)]
    pub stats: bool,
    /// TCP only: malformed MBAP headers a client IP may send before it is
    /// disconnected and refused for a while. Unlimited when absent.
    #[serde(rename = "maxBufferOverflows", default)]
    pub max_buffer_overflows: Option<u32>,
    #[serde(default)]
    pub data: FieldMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(rename = "type")]
    pub transport: TransportKind,
    #[serde(rename = "socketOptions", default)]
    pub socket_options: Option<SocketOptions>,
    #[serde(rename = "serialPortOptions", default)]
    pub serial_port_options: Option<SerialPortOptions>,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_interval_ms")]
    pub interval: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub addressingoffset: i64,
    #[serde(default = "default_concurrent_transactions")]
    pub concurrent_transactions: usize,
    #[serde(default)]
    pub stats: bool,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "ModbusRequestType", default)]
    pub request_type: Option<String>,
    /// Overrides the master interval (ms)
    #[serde(default)]
    pub interval: Option<u64>,
    /// Overrides the master timeout (ms)
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub data: FieldMap,
    #[serde(default)]
    pub writedata: Option<FieldMap>,
    #[serde(flatten)]
    pub unexpected: BTreeMap<String, serde_json::Value>,
}

fn default_name() -> String {
    "ModbusSimulator".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    "homie/".to_string()
}

fn default_socket_host() -> String {
    "0.0.0.0".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_serial_timeout_ms() -> u64 {
    100
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    10
}

fn default_concurrent_transactions() -> usize {
    20
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            base_topic: default_base_topic(),
            auth: false,
            username: None,
            password: None,
            debug: false,
        }
    }
}

impl AppConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read configuration file {file_path}"))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse configuration file {file_path}"))
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Lets one file drive several instances: `NAME` replaces both the
    /// display name and the device id.
    pub fn apply_name_override(&mut self, name: Option<String>) {
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            self.device_id = Some(name.clone());
            self.name = name;
        }
    }

    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| self.name.replace(' ', "-"))
            .to_lowercase()
    }

    pub fn stats_enabled(&self) -> bool {
        self.slave.as_ref().is_some_and(|slave| slave.stats)
            || self.master.as_ref().is_some_and(|master| master.stats)
    }
}

impl MasterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl SlaveConfig {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay > 0).then(|| Duration::from_millis(self.delay))
    }
}

/// Endpoint a transport should bind to or connect to.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Socket(TransportKind, String),
    Serial(TransportKind, SerialPortOptions),
}

impl Endpoint {
    pub fn proto(&self) -> ModbusProto {
        match self {
            Self::Socket(kind, _) | Self::Serial(kind, _) => kind.proto(),
        }
    }
}

pub fn endpoint(
    transport: TransportKind,
    socket: Option<&SocketOptions>,
    serial: Option<&SerialPortOptions>,
) -> Result<Endpoint> {
    match transport {
        TransportKind::Tcp | TransportKind::Udp => {
            let socket = socket.ok_or_else(|| anyhow!("{transport} transport needs socket options"))?;
            Ok(Endpoint::Socket(
                transport,
                format!("{}:{}", socket.host, socket.port),
            ))
        }
        TransportKind::SerialRtu | TransportKind::SerialAscii => serial
            .cloned()
            .map(|options| Endpoint::Serial(transport, options))
            .ok_or_else(|| anyhow!("{transport} transport needs serialPortOptions")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "Boiler Room",
        "mqtt": { "host": "broker.local" },
        "slave": {
            "type": "tcp",
            "serverOptions": { "host": "127.0.0.1", "port": 5020 },
            "delay": 20,
            "data": {
                "AO": { "setpoint": { "address": 0, "type": "integer", "register": "UInt16BE", "default": 42 } },
                "DI#2": { "door": { "address": 3, "type": "boolean", "libelle": "Door" } }
            }
        },
        "master": {
            "type": "serial-rtu",
            "serialPortOptions": { "path": "/dev/ttyUSB0", "baudRate": 19200 },
            "requests": [
                { "label": "tank", "ModbusRequestType": "readwrite", "interval": 250, "data": {}, "writedata": {} }
            ]
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.device_id(), "boiler-room");

        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.base_topic, "homie/");

        let slave = config.slave.as_ref().unwrap();
        assert_eq!(slave.transport, TransportKind::Tcp);
        assert_eq!(slave.delay(), Some(Duration::from_millis(20)));
        assert_eq!(slave.data["DI#2"]["door"].label, "Door");

        let master = config.master.as_ref().unwrap();
        assert_eq!(master.transport, TransportKind::SerialRtu);
        assert_eq!(master.interval, 1000);
        assert_eq!(master.timeout, 500);
        assert_eq!(master.max_retries, 10);
        assert_eq!(master.concurrent_transactions, 20);
        assert_eq!(master.serial_port_options.as_ref().unwrap().baud_rate, 19200);
        assert_eq!(master.requests[0].request_type.as_deref(), Some("readwrite"));
        assert_eq!(master.requests[0].interval, Some(250));
    }

    #[test]
    fn test_name_override() {
        let mut config = AppConfig::from_json(SAMPLE).unwrap();
        config.apply_name_override(None);
        assert_eq!(config.name, "Boiler Room");
        config.apply_name_override(Some("sim-2".to_string()));
        assert_eq!(config.name, "sim-2");
        assert_eq!(config.device_id(), "sim-2");
    }

    #[test]
    fn test_request_type_names() {
        assert_eq!("readsingle".parse::<RequestType>().ok(), Some(RequestType::ReadSingle));
        assert_eq!(RequestType::ReadWrite.to_string(), "readwrite");
        assert!("readsome".parse::<RequestType>().is_err());
    }

    #[test]
    fn test_endpoint_requires_options() {
        assert!(endpoint(TransportKind::Tcp, None, None).is_err());
        let socket = SocketOptions {
            host: "10.0.0.2".to_string(),
            port: 502,
        };
        assert!(matches!(
            endpoint(TransportKind::Udp, Some(&socket), None).unwrap(),
            Endpoint::Socket(TransportKind::Udp, addr) if addr == "10.0.0.2:502"
        ));
        let serial = SerialPortOptions {
            path: "/dev/ttyS1".to_string(),
            baud_rate: 9600,
            data_bits: 7,
            stop_bits: 1,
            parity: "even".to_string(),
            timeout_ms: 100,
        };
        let ascii = endpoint(TransportKind::SerialAscii, None, Some(&serial)).unwrap();
        assert_eq!(ascii.proto(), ModbusProto::Ascii);
        assert!(endpoint(TransportKind::SerialAscii, None, None).is_err());
    }

    #[test]
    fn test_ascii_transport_and_overflow_limit() {
        let slave: SlaveConfig = serde_json::from_value(serde_json::json!({
            "type": "serial-ascii",
            "serialPortOptions": { "path": "/dev/ttyS0" }
        }))
        .unwrap();
        assert_eq!(slave.transport, TransportKind::SerialAscii);
        assert_eq!(slave.max_buffer_overflows, None);

        let slave: SlaveConfig = serde_json::from_value(serde_json::json!({
            "type": "tcp",
            "maxBufferOverflows": 3
        }))
        .unwrap();
        assert_eq!(slave.max_buffer_overflows, Some(3));
        assert_eq!(TransportKind::Udp.proto(), ModbusProto::TcpUdp);
    }
}
