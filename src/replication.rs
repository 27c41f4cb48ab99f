//! PLC-to-PLC replication engine.
//!
//! Owns the mapping table and runs one cooperative loop per enabled
//! master node. Each iteration walks that node's enabled mappings in
//! insertion order and pipes source-read → canonical conversion →
//! target-write according to the mapping's sync mode. Failures are
//! recorded and reported; the loop itself never dies — reconnection is
//! the supervisor's job, and the next iteration simply tries again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{MappingConfig, NodeConfig, SyncMode};
use crate::driver::{ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::value::PlcValue;

/// A registered PLC node as the replication engine sees it.
#[derive(Debug, Clone)]
pub struct PlcNode {
    pub id: String,
    pub name: String,
    pub is_master: bool,
    pub sync_interval_ms: u64,
    pub priority: u8,
    pub enabled: bool,
}

impl From<&NodeConfig> for PlcNode {
    fn from(config: &NodeConfig) -> Self {
        PlcNode {
            id: config.id.clone(),
            name: if config.name.is_empty() {
                config.id.clone()
            } else {
                config.name.clone()
            },
            is_master: config.is_master,
            sync_interval_ms: config.sync_interval_ms,
            priority: config.priority,
            enabled: config.enabled,
        }
    }
}

/// Sink for replication outcomes.
pub trait SyncListener: Send + Sync {
    /// Fired after every successful target write.
    fn on_data_sync(&self, mapping: &MappingConfig, value: &PlcValue);
    /// Fired for every failed sync step. Never terminates the loop.
    fn on_error(&self, mapping: &MappingConfig, error: &GatewayError);
}

/// Per-mapping runtime state.
struct MappingState {
    config: MappingConfig,
    /// Last value written, for on_change suppression.
    last_sent: Mutex<Option<PlcValue>>,
    /// Completion instant of the last sync, for periodic mode.
    last_sync: Mutex<Option<std::time::Instant>>,
}

struct NodeEntry {
    node: PlcNode,
    driver: Arc<dyn ProtocolDriver>,
}

/// The replication engine: mapping table plus per-master sync loops.
pub struct ReplicationEngine {
    nodes: Mutex<HashMap<String, Arc<NodeEntry>>>,
    mappings: Mutex<Vec<Arc<MappingState>>>,
    listeners: Mutex<Vec<Arc<dyn SyncListener>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    self_ref: std::sync::Weak<ReplicationEngine>,
}

impl ReplicationEngine {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| ReplicationEngine {
            nodes: Mutex::new(HashMap::new()),
            mappings: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SyncListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Node registry
    // ------------------------------------------------------------------

    /// Register a node with its driver. If the engine is running and the
    /// node is an enabled master, its sync loop starts immediately.
    pub fn register_node(
        &self,
        node: PlcNode,
        driver: Arc<dyn ProtocolDriver>,
    ) -> GatewayResult<()> {
        let id = node.id.clone();
        {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&id) {
                return Err(GatewayError::configuration(format!(
                    "Node '{}' is already registered",
                    id
                )));
            }
            nodes.insert(id.clone(), Arc::new(NodeEntry { node, driver }));
        }
        info!(node = %id, "node registered");
        if self.is_running() {
            self.start_sync_for(&id);
        }
        Ok(())
    }

    /// Remove a node, stop its loop, and drop every mapping that
    /// references it — a mapping may exist only while both endpoints are
    /// registered.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.nodes.lock().unwrap().remove(node_id).is_some();
        if removed {
            if let Some(task) = self.tasks.lock().unwrap().remove(node_id) {
                task.abort();
            }
            self.mappings.lock().unwrap().retain(|m| {
                m.config.source_node_id != node_id && m.config.target_node_id != node_id
            });
            info!(node = %node_id, "node removed");
        }
        removed
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    fn driver_for(&self, node_id: &str) -> GatewayResult<Arc<dyn ProtocolDriver>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|entry| Arc::clone(&entry.driver))
            .ok_or_else(|| {
                GatewayError::configuration(format!("Unknown node '{}'", node_id))
            })
    }

    // ------------------------------------------------------------------
    // Mapping table
    // ------------------------------------------------------------------

    /// Add a mapping. Both endpoints must be registered.
    pub fn add_mapping(&self, config: MappingConfig) -> GatewayResult<()> {
        let nodes = self.nodes.lock().unwrap();
        for node_id in [&config.source_node_id, &config.target_node_id] {
            if !nodes.contains_key(node_id.as_str()) {
                return Err(GatewayError::configuration(format!(
                    "Mapping references unknown node '{}'",
                    node_id
                )));
            }
        }
        drop(nodes);

        debug!(
            source = %config.source_node_id,
            target = %config.target_node_id,
            "mapping added"
        );
        self.mappings.lock().unwrap().push(Arc::new(MappingState {
            config,
            last_sent: Mutex::new(None),
            last_sync: Mutex::new(None),
        }));
        Ok(())
    }

    /// Remove the first mapping between `source` and `target`.
    pub fn remove_mapping(&self, source_node_id: &str, target_node_id: &str) -> bool {
        let mut mappings = self.mappings.lock().unwrap();
        let before = mappings.len();
        if let Some(pos) = mappings.iter().position(|m| {
            m.config.source_node_id == source_node_id
                && m.config.target_node_id == target_node_id
        }) {
            mappings.remove(pos);
        }
        mappings.len() != before
    }

    /// Snapshot of the mapping table in insertion order.
    pub fn mappings(&self) -> Vec<MappingConfig> {
        self.mappings
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.config.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    /// Start sync loops for every enabled master node.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.cancel.lock().unwrap() = CancellationToken::new();

        let masters: Vec<String> = self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.node.is_master && e.node.enabled)
            .map(|e| e.node.id.clone())
            .collect();
        for id in masters {
            self.start_sync_for(&id);
        }
        info!("replication started");
    }

    /// Cancel every sync loop and wait for none to be runnable.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.lock().unwrap().cancel();
        let mut tasks = self.tasks.lock().unwrap();
        for (_, task) in tasks.drain() {
            task.abort();
        }
        info!("replication stopped");
    }

    fn start_sync_for(&self, node_id: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(node_id) {
            return;
        }
        let Some(entry) = self.nodes.lock().unwrap().get(node_id).map(Arc::clone) else {
            return;
        };
        if !entry.node.is_master || !entry.node.enabled {
            return;
        }

        let engine = self.self_ref.clone();
        let cancel = self.cancel.lock().unwrap().clone();
        let id = node_id.to_string();
        debug!(node = %id, "sync loop starting");
        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(entry.node.sync_interval_ms.max(1));
            loop {
                // Hold the engine only for the duration of one pass so the
                // loop does not keep a dropped engine alive.
                let iteration = async {
                    if let Some(engine) = engine.upgrade() {
                        engine.sync_iteration(&entry.node.id).await;
                        true
                    } else {
                        false
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    alive = iteration => {
                        if !alive {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        tasks.insert(id, handle);
    }

    /// One pass over this node's enabled mappings, in insertion order.
    async fn sync_iteration(&self, node_id: &str) {
        let mappings: Vec<Arc<MappingState>> = self
            .mappings
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.config.enabled && m.config.source_node_id == node_id)
            .cloned()
            .collect();

        for mapping in mappings {
            if !self.is_running() {
                break;
            }
            self.sync_mapping(&mapping).await;
        }
    }

    /// Apply one mapping's sync policy.
    async fn sync_mapping(&self, state: &MappingState) {
        let config = &state.config;

        if config.sync_mode == SyncMode::Periodic {
            let due = {
                let last = state.last_sync.lock().unwrap();
                match *last {
                    None => true,
                    Some(at) => at.elapsed() >= Duration::from_millis(config.sync_interval_ms),
                }
            };
            if !due {
                return;
            }
        }

        match self.sync_once_inner(state).await {
            Ok(Some(value)) => {
                *state.last_sync.lock().unwrap() = Some(std::time::Instant::now());
                self.notify_sync(config, &value);
            }
            Ok(None) => {} // on_change suppression, nothing written
            Err(e) => {
                error!(
                    source = %config.source_node_id,
                    target = %config.target_node_id,
                    error = %e,
                    "sync failed"
                );
                self.notify_error(config, &e);
            }
        }
    }

    /// Synchronize one mapping now, regardless of its schedule. Returns
    /// the written value, or `None` when on_change suppressed the write.
    pub async fn sync_once(&self, config: &MappingConfig) -> GatewayResult<Option<PlcValue>> {
        let state = MappingState {
            config: config.clone(),
            last_sent: Mutex::new(None),
            last_sync: Mutex::new(None),
        };
        self.sync_once_inner(&state).await
    }

    async fn sync_once_inner(&self, state: &MappingState) -> GatewayResult<Option<PlcValue>> {
        let config = &state.config;
        let source = self.driver_for(&config.source_node_id)?;
        let target = self.driver_for(&config.target_node_id)?;

        // Read one element from the source.
        let request = ReadRequest::new(&config.source_address, 1, config.source_data_type);
        let mut values = source.read(&request).await?;
        if values.is_empty() {
            return Err(GatewayError::data(format!(
                "Source {} returned no data",
                config.source_address
            )));
        }
        let current = values.remove(0);

        if config.sync_mode == SyncMode::OnChange {
            let last = state.last_sent.lock().unwrap().clone();
            if last.as_ref() == Some(&current) {
                return Ok(None);
            }
        }

        // Convert through the canonical domain; overflow is a data error
        // and nothing is written.
        let converted = current.convert(config.target_data_type)?;

        let write = WriteRequest {
            address: config.target_address.clone(),
            value: converted.clone(),
            data_type: config.target_data_type,
            timeout_ms: None,
        };
        target.write(&write).await?;

        *state.last_sent.lock().unwrap() = Some(current);
        Ok(Some(converted))
    }

    fn notify_sync(&self, mapping: &MappingConfig, value: &PlcValue) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_data_sync(mapping, value);
        }
    }

    fn notify_error(&self, mapping: &MappingConfig, error: &GatewayError) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_error(mapping, error);
        }
    }
}

impl Drop for ReplicationEngine {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().unwrap().drain() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
