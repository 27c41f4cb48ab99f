//! PLC network orchestration.
//!
//! Loads a declarative configuration, constructs one protocol driver per
//! node, wires the replication engine, and optionally runs an
//! auto-recovery loop that re-connects any enabled node found
//! disconnected. Stopping the network cancels replication first, then
//! the recovery loop, then disconnects every driver (which stops its
//! heartbeat before the transport closes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{NetworkConfig, NodeConfig, ProtocolConfig, ProtocolKind};
use crate::driver::{ProtocolDriver, ProtocolStatus};
use crate::eip::EipDriver;
use crate::error::{GatewayError, GatewayResult};
use crate::modbus::ModbusDriver;
use crate::opcua::OpcUaDriver;
use crate::profibus::ProfibusDriver;
use crate::replication::{PlcNode, ReplicationEngine};
use crate::s7::S7Driver;

/// Aggregated status of one node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    pub is_master: bool,
    pub enabled: bool,
    pub status: ProtocolStatus,
}

/// Aggregated status of the whole network.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub name: String,
    pub running: bool,
    pub mapping_count: usize,
    pub nodes: Vec<NodeStatus>,
}

struct ManagedNode {
    meta: PlcNode,
    driver: Arc<dyn ProtocolDriver>,
}

/// A managed network of PLC nodes with replication and auto-recovery.
pub struct PlcNetwork {
    name: String,
    nodes: Mutex<HashMap<String, Arc<ManagedNode>>>,
    engine: Arc<ReplicationEngine>,
    recovery_interval_ms: u64,
    auto_recovery: bool,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    self_ref: std::sync::Weak<PlcNetwork>,
}

impl PlcNetwork {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), 5000, true)
    }

    fn build(name: String, recovery_interval_ms: u64, auto_recovery: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| PlcNetwork {
            name,
            nodes: Mutex::new(HashMap::new()),
            engine: ReplicationEngine::new(),
            recovery_interval_ms,
            auto_recovery,
            recovery_task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Build a network from a declarative configuration object.
    pub fn from_config(name: impl Into<String>, config: NetworkConfig) -> GatewayResult<Arc<Self>> {
        config.validate()?;

        let network = Self::build(
            name.into(),
            config.recovery_interval_ms,
            config.auto_recovery,
        );

        for node in &config.plcs {
            let driver = build_driver(node)?;
            network.add_node_with_driver(node.into(), driver)?;
        }
        for mapping in &config.mappings {
            network.engine.add_mapping(mapping.clone())?;
        }
        info!(
            network = %network.name,
            nodes = config.plcs.len(),
            mappings = config.mappings.len(),
            "network configured"
        );
        Ok(network)
    }

    /// The replication engine owned by this network.
    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    /// Driver of a node, by id. Mappings refer to nodes by id only, so
    /// drivers stay replaceable behind this lookup.
    pub fn driver(&self, node_id: &str) -> Option<Arc<dyn ProtocolDriver>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| Arc::clone(&n.driver))
    }

    /// Register a node backed by an already-constructed driver.
    pub fn add_node_with_driver(
        &self,
        meta: PlcNode,
        driver: Arc<dyn ProtocolDriver>,
    ) -> GatewayResult<()> {
        let id = meta.id.clone();
        {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&id) {
                return Err(GatewayError::configuration(format!(
                    "Node '{}' already exists",
                    id
                )));
            }
            nodes.insert(
                id.clone(),
                Arc::new(ManagedNode {
                    meta: meta.clone(),
                    driver: Arc::clone(&driver),
                }),
            );
        }
        self.engine.register_node(meta, driver)
    }

    /// Build and register a node from configuration.
    pub fn add_node(&self, node: &NodeConfig) -> GatewayResult<()> {
        let driver = build_driver(node)?;
        self.add_node_with_driver(node.into(), driver)
    }

    /// Disconnect and remove a node; its mappings are dropped with it.
    pub async fn remove_node(&self, node_id: &str) -> bool {
        let driver = self.driver(node_id);
        let removed = self.engine.remove_node(node_id);
        self.nodes.lock().unwrap().remove(node_id);
        if let Some(driver) = driver {
            driver.disconnect().await.ok();
        }
        removed
    }

    /// Connect every enabled node, start replication, and launch the
    /// auto-recovery loop. Individual connect failures are recorded and
    /// left to recovery; they do not abort the start.
    pub async fn start_network(&self) -> GatewayResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.cancel.lock().unwrap() = CancellationToken::new();

        let nodes: Vec<Arc<ManagedNode>> =
            self.nodes.lock().unwrap().values().cloned().collect();
        for node in &nodes {
            if !node.meta.enabled {
                continue;
            }
            if let Err(e) = node.driver.connect().await {
                warn!(node = %node.meta.id, error = %e, "initial connect failed");
            }
        }

        self.engine.start();

        if self.auto_recovery {
            let network = self.self_ref.clone();
            let cancel = self.cancel.lock().unwrap().clone();
            let interval = Duration::from_millis(self.recovery_interval_ms.max(1));
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let Some(network) = network.upgrade() else {
                        break;
                    };
                    network.recover_disconnected().await;
                }
            });
            *self.recovery_task.lock().unwrap() = Some(handle);
        }

        info!(network = %self.name, "network started");
        Ok(())
    }

    /// Reconnect any enabled node whose driver reports disconnected.
    async fn recover_disconnected(&self) {
        let nodes: Vec<Arc<ManagedNode>> =
            self.nodes.lock().unwrap().values().cloned().collect();
        for node in nodes {
            if !node.meta.enabled || node.driver.status().is_connected {
                continue;
            }
            info!(node = %node.meta.id, "auto-recovery reconnect");
            if let Err(e) = node.driver.connect().await {
                warn!(node = %node.meta.id, error = %e, "auto-recovery failed");
            }
        }
    }

    /// Stop everything: replication loops, then the recovery loop, then
    /// each driver (heartbeat cancelled before its transport closes).
    pub async fn stop_network(&self) -> GatewayResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.engine.stop();
        self.cancel.lock().unwrap().cancel();
        if let Some(handle) = self.recovery_task.lock().unwrap().take() {
            handle.abort();
        }

        let nodes: Vec<Arc<ManagedNode>> =
            self.nodes.lock().unwrap().values().cloned().collect();
        for node in nodes {
            node.driver.disconnect().await.ok();
        }

        info!(network = %self.name, "network stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Aggregated per-node connection state and statistics.
    pub fn network_status(&self) -> NetworkStatus {
        let mut nodes: Vec<NodeStatus> = self
            .nodes
            .lock()
            .unwrap()
            .values()
            .map(|n| NodeStatus {
                id: n.meta.id.clone(),
                name: n.meta.name.clone(),
                is_master: n.meta.is_master,
                enabled: n.meta.enabled,
                status: n.driver.status(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        NetworkStatus {
            name: self.name.clone(),
            running: self.is_running(),
            mapping_count: self.engine.mappings().len(),
            nodes,
        }
    }
}

/// Instantiate the driver for a node's protocol kind.
fn build_driver(node: &NodeConfig) -> GatewayResult<Arc<dyn ProtocolDriver>> {
    driver_for_protocol(node.protocol.clone())
}

/// Instantiate a driver from a bare protocol configuration.
pub fn driver_for_protocol(config: ProtocolConfig) -> GatewayResult<Arc<dyn ProtocolDriver>> {
    config.validate()?;
    Ok(match config.protocol_kind {
        ProtocolKind::S7 => S7Driver::new(config),
        ProtocolKind::ModbusTcp | ProtocolKind::ModbusRtu => ModbusDriver::new(config),
        ProtocolKind::ProfibusDp => ProfibusDriver::new(config),
        ProtocolKind::EthernetIp => EipDriver::new(config),
        ProtocolKind::OpcUa => OpcUaDriver::new(config),
    })
}

// ============================================================================
// Tests
// ============================================================================
