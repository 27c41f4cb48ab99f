//! Declarative configuration model.
//!
//! A network is described by one JSON object `{plcs: [...], mappings: [...]}`
//! plus optional recovery settings. All types round-trip through serde so
//! configurations can be stored, diffed and served unchanged.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::value::DataType;

/// Supported protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    S7,
    ModbusTcp,
    ModbusRtu,
    ProfibusDp,
    EthernetIp,
    OpcUa,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::S7 => "s7",
            ProtocolKind::ModbusTcp => "modbus_tcp",
            ProtocolKind::ModbusRtu => "modbus_rtu",
            ProtocolKind::ProfibusDp => "profibus_dp",
            ProtocolKind::EthernetIp => "ethernet_ip",
            ProtocolKind::OpcUa => "opc_ua",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-driver configuration. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub protocol_kind: ProtocolKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    // Kind-specific fields.
    /// Modbus unit identifier (TCP header / RTU address byte).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Profibus-DP slave address.
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,
    /// Ethernet/IP CIP routing path ("backplane,slot").
    #[serde(default = "default_cip_path")]
    pub cip_path: String,
    /// OPC UA namespace URI used for symbolic addresses without `ns=`.
    #[serde(default = "default_namespace_uri")]
    pub namespace_uri: String,
    /// S7 rack number.
    #[serde(default)]
    pub rack: u16,
    /// S7 slot number.
    #[serde(default = "default_slot")]
    pub slot: u16,
    /// Serial device path for Modbus RTU (e.g. "/dev/ttyUSB0").
    #[serde(default)]
    pub serial_device: String,
    /// Serial baud rate for Modbus RTU.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_port() -> u16 {
    502
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    30000
}
fn default_true() -> bool {
    true
}
fn default_unit_id() -> u8 {
    1
}
fn default_slave_address() -> u8 {
    1
}
fn default_cip_path() -> String {
    "1,0".to_string()
}
fn default_namespace_uri() -> String {
    "http://opcfoundation.org/UA/".to_string()
}
fn default_slot() -> u16 {
    1
}
fn default_baud_rate() -> u32 {
    9600
}

impl ProtocolConfig {
    /// Minimal config for a protocol kind and host; remaining fields take
    /// their documented defaults.
    pub fn new(protocol_kind: ProtocolKind, host: impl Into<String>) -> Self {
        ProtocolConfig {
            protocol_kind,
            host: host.into(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auto_reconnect: true,
            unit_id: default_unit_id(),
            slave_address: default_slave_address(),
            cip_path: default_cip_path(),
            namespace_uri: default_namespace_uri(),
            rack: 0,
            slot: default_slot(),
            serial_device: String::new(),
            baud_rate: default_baud_rate(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay_ms: u64) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Validate kind-specific requirements.
    pub fn validate(&self) -> GatewayResult<()> {
        match self.protocol_kind {
            ProtocolKind::ModbusRtu => {
                if self.serial_device.is_empty() {
                    return Err(GatewayError::configuration(
                        "Modbus RTU requires a serial_device",
                    ));
                }
            }
            _ => {
                if self.host.is_empty() {
                    return Err(GatewayError::configuration(format!(
                        "{} requires a host",
                        self.protocol_kind
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One PLC node in the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
    /// Whether this node sources replication mappings.
    #[serde(default)]
    pub is_master: bool,
    /// Pace of this node's replication loop.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_sync_interval_ms() -> u64 {
    1000
}
fn default_priority() -> u8 {
    1
}

/// Synchronization policy of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Continuous,
    OnChange,
    Periodic,
}

/// Declarative source→target variable mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub source_node_id: String,
    pub source_address: String,
    pub source_data_type: DataType,
    pub target_node_id: String,
    pub target_address: String,
    pub target_data_type: DataType,
    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncMode,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Continuous
}

/// Whole-network configuration: nodes plus mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub plcs: Vec<NodeConfig>,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
    #[serde(default = "default_true")]
    pub auto_recovery: bool,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

fn default_recovery_interval_ms() -> u64 {
    5000
}

impl NetworkConfig {
    /// Load a configuration from its JSON representation.
    pub fn from_json(json: &str) -> GatewayResult<Self> {
        let config: NetworkConfig = serde_json::from_str(json)
            .map_err(|e| GatewayError::configuration(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check node uniqueness and that every mapping references known nodes.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.plcs {
            if node.id.is_empty() {
                return Err(GatewayError::configuration("Node id must not be empty"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(GatewayError::configuration(format!(
                    "Duplicate node id '{}'",
                    node.id
                )));
            }
            node.protocol.validate()?;
        }
        for mapping in &self.mappings {
            for node_id in [&mapping.source_node_id, &mapping.target_node_id] {
                if !seen.contains(node_id.as_str()) {
                    return Err(GatewayError::configuration(format!(
                        "Mapping references unknown node '{}'",
                        node_id
                    )));
                }
            }
        }
        Ok(())
    }
}
