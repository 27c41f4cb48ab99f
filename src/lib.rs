//! # Fieldgate - Multi-Protocol Industrial Gateway
//!
//! A gateway library that mediates read/write access to PLCs and
//! variable-frequency drives across heterogeneous protocols, and
//! coordinates data replication between them. One process hosts several
//! protocol clients behind a uniform request/response contract, with two
//! services layered on top: PLC-to-PLC replication and a VFD control
//! facade.
//!
//! ## Supported Protocols
//!
//! | Protocol | Transport | Driver |
//! |----------|-----------|--------|
//! | S7 | ISO-on-TCP (RFC 1006) | [`S7Driver`] |
//! | Modbus TCP | MBAP over TCP | [`ModbusDriver`] |
//! | Modbus RTU | serial + CRC16 (`rtu` feature) | [`ModbusDriver`] |
//! | Profibus-DP | ISO-on-TCP, DP client mode | [`ProfibusDriver`] |
//! | Ethernet/IP | encapsulation + CIP | [`EipDriver`] |
//! | OPC UA | opc.tcp binary | [`OpcUaDriver`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fieldgate::{
//!     DataType, ModbusDriver, ProtocolConfig, ProtocolDriver, ProtocolKind,
//!     ReadRequest, WriteRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> fieldgate::GatewayResult<()> {
//!     let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "192.168.1.20")
//!         .with_port(502)
//!         .with_timeout_ms(2000);
//!     let driver = ModbusDriver::new(config);
//!
//!     driver.connect().await?;
//!     driver
//!         .write(&WriteRequest::new("100", 0x1234u16, DataType::HoldingRegister))
//!         .await?;
//!     let values = driver
//!         .read(&ReadRequest::new("100", 1, DataType::HoldingRegister))
//!         .await?;
//!     println!("HR100 = {:?}", values);
//!     driver.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! Replication between dissimilar nodes is declarative: a
//! [`NetworkConfig`] lists the nodes and the source→target mappings, and
//! [`PlcNetwork`] runs the drivers, the sync loops and auto-recovery.

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Canonical value variant and industrial data types
pub mod value;

/// Encoding and decoding between values and protocol byte layouts
pub mod codec;

/// PLC address grammar and resolution
pub mod address;

/// Declarative configuration model
pub mod config;

/// The uniform protocol driver contract
pub mod driver;

/// Connection supervision: state machine, heartbeat, statistics
pub mod supervisor;

// ============================================================================
// Protocol drivers
// ============================================================================

/// Shared ISO-on-TCP transport for the S7 family
pub mod iso_tcp;

/// S7 driver
pub mod s7;

/// Profibus-DP driver
pub mod profibus;

/// Modbus TCP/RTU driver
pub mod modbus;

/// Ethernet/IP driver with CIP session semantics
pub mod eip;

/// OPC UA driver
pub mod opcua;

// ============================================================================
// Services
// ============================================================================

/// PLC-to-PLC replication engine
pub mod replication;

/// VFD control facade
pub mod vfd;

/// Network orchestration and auto-recovery
pub mod network;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use address::{Address, MemoryArea, NodeIdentifier};
pub use config::{
    MappingConfig, NetworkConfig, NodeConfig, ProtocolConfig, ProtocolKind, SyncMode,
};
pub use driver::{
    CpuInfo, LinkState, PlcRunState, ProtocolDriver, ProtocolStatus, ReadRequest, WriteRequest,
};
pub use eip::EipDriver;
pub use error::{GatewayError, GatewayResult};
pub use modbus::ModbusDriver;
pub use network::{driver_for_protocol, NetworkStatus, NodeStatus, PlcNetwork};
pub use opcua::OpcUaDriver;
pub use profibus::ProfibusDriver;
pub use replication::{PlcNode, ReplicationEngine, SyncListener};
pub use s7::S7Driver;
pub use supervisor::{
    ConnectionListener, ConnectionSupervisor, ErrorListener, HeartbeatListener,
};
pub use value::{DataType, PlcValue};
pub use vfd::{
    decode_status, VfdConfig, VfdController, VfdListener, VfdParameters, VfdRegisterMap,
    VfdStatus,
};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// S7 ISO-on-TCP default port
pub const DEFAULT_S7_PORT: u16 = 102;

/// Ethernet/IP default port
pub const DEFAULT_EIP_PORT: u16 = 44818;

/// OPC UA default port
pub const DEFAULT_OPCUA_PORT: u16 = 4840;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
