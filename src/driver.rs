//! Uniform protocol driver contract.
//!
//! Every protocol client implements [`ProtocolDriver`]: connect/disconnect
//! lifecycle, typed read/write, batched variants, ping and statistics.
//! Drivers are held as `Arc<dyn ProtocolDriver>` by the network and the
//! replication engine; all operations on one driver serialize through a
//! single transport gate, so concurrent callers queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ProtocolKind;
use crate::error::GatewayResult;
use crate::supervisor::ConnectionSupervisor;
use crate::value::{DataType, PlcValue};

/// A read of `count` elements of `data_type` starting at `address`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Numeric offset or symbolic string, protocol-dependent.
    pub address: String,
    pub count: usize,
    pub data_type: DataType,
    /// Per-request override of the driver's configured timeout.
    pub timeout_ms: Option<u64>,
}

impl ReadRequest {
    pub fn new(address: impl Into<String>, count: usize, data_type: DataType) -> Self {
        ReadRequest {
            address: address.into(),
            count,
            data_type,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A write of one value (or a list of elements) to `address`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub address: String,
    pub value: PlcValue,
    pub data_type: DataType,
    pub timeout_ms: Option<u64>,
}

impl WriteRequest {
    pub fn new(
        address: impl Into<String>,
        value: impl Into<PlcValue>,
        data_type: DataType,
    ) -> Self {
        WriteRequest {
            address: address.into(),
            value: value.into(),
            data_type,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Lifecycle state of a driver; exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Error => "error",
            LinkState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Rolling per-driver statistics, owned by the connection supervisor.
#[derive(Debug, Clone)]
pub struct ProtocolStatus {
    pub protocol_kind: ProtocolKind,
    pub state: LinkState,
    pub is_connected: bool,
    pub last_communication: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub success_count: u64,
    /// Running mean of operation round-trip time in milliseconds.
    pub response_time_avg_ms: f64,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_count: u32,
}

impl ProtocolStatus {
    pub fn new(protocol_kind: ProtocolKind) -> Self {
        ProtocolStatus {
            protocol_kind,
            state: LinkState::Disconnected,
            is_connected: false,
            last_communication: None,
            error_count: 0,
            success_count: 0,
            response_time_avg_ms: 0.0,
            reconnect_count: 0,
        }
    }
}

/// CPU identification strings reported by an S7-family controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuInfo {
    pub module_type_name: String,
    pub serial_number: String,
    pub as_name: String,
    pub module_name: String,
}

/// Coarse CPU run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcRunState {
    Run,
    Stop,
    Unknown,
}

/// The uniform request/response contract implemented by every protocol.
///
/// `connect` on an already-connected driver and `disconnect` on an
/// already-disconnected driver are successful no-ops. Operations on the
/// same driver observe FIFO submission order; a successful `write` is
/// transport-acknowledged before it returns.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Establish the transport and protocol session.
    async fn connect(&self) -> GatewayResult<()>;

    /// Close the session and the transport.
    async fn disconnect(&self) -> GatewayResult<()>;

    /// Read `request.count` elements.
    async fn read(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>>;

    /// Write one value.
    async fn write(&self, request: &WriteRequest) -> GatewayResult<()>;

    /// Issue several reads; results are indexed by request position.
    async fn read_many(
        &self,
        requests: &[ReadRequest],
    ) -> Vec<GatewayResult<Vec<PlcValue>>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.read(request).await);
        }
        results
    }

    /// Issue several writes; results are indexed by request position.
    async fn write_many(&self, requests: &[WriteRequest]) -> Vec<GatewayResult<()>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.write(request).await);
        }
        results
    }

    /// Lightweight liveness probe through the same serializing gate.
    async fn ping(&self) -> bool;

    /// Current supervisor-owned status snapshot.
    fn status(&self) -> ProtocolStatus {
        self.supervisor().status()
    }

    /// Reset success/error/latency counters.
    fn reset_statistics(&self) {
        self.supervisor().reset_statistics();
    }

    /// The connection supervisor embedded in this driver.
    fn supervisor(&self) -> &Arc<ConnectionSupervisor>;
}

/// Apply a per-request timeout override around a driver operation.
///
/// The transport already enforces the configured timeout; this wraps the
/// whole operation when the request carries its own budget.
pub(crate) async fn with_timeout<T, F>(
    timeout_ms: Option<u64>,
    operation: &str,
    fut: F,
) -> GatewayResult<T>
where
    F: std::future::Future<Output = GatewayResult<T>>,
{
    match timeout_ms {
        None => fut.await,
        Some(ms) => match tokio::time::timeout(std::time::Duration::from_millis(ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::GatewayError::timeout(operation, ms)),
        },
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory driver used by replication, VFD and network tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;
    use crate::config::ProtocolConfig;
    use crate::error::GatewayError;

    /// Mock driver backed by an address→value map, with scripted failures.
    pub struct MockDriver {
        supervisor: Arc<ConnectionSupervisor>,
        pub cells: Mutex<HashMap<String, PlcValue>>,
        /// Log of every write in arrival order.
        pub writes: Mutex<Vec<WriteRequest>>,
        /// Scripted read errors, consumed FIFO before touching cells.
        pub read_faults: Mutex<VecDeque<GatewayError>>,
        pub fail_connect: Mutex<bool>,
        pub fail_ping: Mutex<bool>,
        pub connect_attempts: Mutex<u32>,
        self_ref: std::sync::Weak<MockDriver>,
    }

    impl MockDriver {
        pub fn new() -> Arc<Self> {
            let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "mock")
                .with_heartbeat_interval_ms(0);
            Self::with_config(config)
        }

        pub fn with_config(config: ProtocolConfig) -> Arc<Self> {
            Arc::new_cyclic(|weak| MockDriver {
                supervisor: Arc::new(ConnectionSupervisor::new(config)),
                cells: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
                read_faults: Mutex::new(VecDeque::new()),
                fail_connect: Mutex::new(false),
                fail_ping: Mutex::new(false),
                connect_attempts: Mutex::new(0),
                self_ref: weak.clone(),
            })
        }

        pub fn set_cell(&self, address: &str, value: PlcValue) {
            self.cells.lock().unwrap().insert(address.to_string(), value);
        }

        pub fn cell(&self, address: &str) -> Option<PlcValue> {
            self.cells.lock().unwrap().get(address).cloned()
        }

        pub fn push_read_fault(&self, err: GatewayError) {
            self.read_faults.lock().unwrap().push_back(err);
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProtocolDriver for MockDriver {
        async fn connect(&self) -> GatewayResult<()> {
            *self.connect_attempts.lock().unwrap() += 1;
            if *self.fail_connect.lock().unwrap() {
                self.supervisor.mark_error();
                return Err(GatewayError::connection("mock connect failure"));
            }
            self.supervisor.mark_connected();
            let weak: std::sync::Weak<dyn ProtocolDriver> = self.self_ref.clone();
            Arc::clone(&self.supervisor).ensure_heartbeat(weak);
            Ok(())
        }

        async fn disconnect(&self) -> GatewayResult<()> {
            self.supervisor.stop_heartbeat();
            self.supervisor.mark_disconnected();
            Ok(())
        }

        async fn read(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
            if let Some(err) = self.read_faults.lock().unwrap().pop_front() {
                self.supervisor.record(false, 1.0);
                return Err(err);
            }
            let value = self
                .cells
                .lock()
                .unwrap()
                .get(&request.address)
                .cloned()
                .unwrap_or_else(|| PlcValue::zero_for(request.data_type));
            self.supervisor.record(true, 1.0);
            Ok(vec![value; request.count.max(1)])
        }

        async fn write(&self, request: &WriteRequest) -> GatewayResult<()> {
            self.cells
                .lock()
                .unwrap()
                .insert(request.address.clone(), request.value.clone());
            self.writes.lock().unwrap().push(request.clone());
            self.supervisor.record(true, 1.0);
            Ok(())
        }

        async fn ping(&self) -> bool {
            self.supervisor.is_connected() && !*self.fail_ping.lock().unwrap()
        }

        fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
            &self.supervisor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let read = ReadRequest::new("DB1.DBW0", 2, DataType::UInt16).with_timeout_ms(250);
        assert_eq!(read.count, 2);
        assert_eq!(read.timeout_ms, Some(250));

        let write = WriteRequest::new("Q0.3", true, DataType::Bool);
        assert_eq!(write.value, PlcValue::Bool(true));
        assert_eq!(write.timeout_ms, None);
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Connected.to_string(), "connected");
        assert_eq!(LinkState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_mock_driver_roundtrip() {
        use mock::MockDriver;

        let driver = MockDriver::new();
        driver.connect().await.unwrap();
        driver
            .write(&WriteRequest::new("100", 42u16, DataType::UInt16))
            .await
            .unwrap();
        let values = driver
            .read(&ReadRequest::new("100", 1, DataType::UInt16))
            .await
            .unwrap();
        assert_eq!(values, vec![PlcValue::UInt(42)]);
        assert!(driver.ping().await);
        driver.disconnect().await.unwrap();
        assert!(!driver.ping().await);
    }
}
