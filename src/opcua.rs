//! OPC UA driver.
//!
//! Wraps the `opcua` client stack: `connect` opens the secure channel and
//! session, spawns the session event loop, then reads the server
//! namespace array to build a `{namespace_uri → index}` map used when
//! resolving symbolic addresses. Reads and writes batch into single
//! service calls; subscriptions deliver data-change notifications through
//! an unbounded channel so the session task is never blocked by a slow
//! consumer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::{ClientBuilder, DataChangeCallback, IdentityToken, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, DataValue, MessageSecurityMode, MonitoredItemCreateRequest, NodeId,
    ReadValueId, StatusCode, TimestampsToReturn, UserTokenPolicy, VariableId, Variant,
    WriteValue,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::address::{Address, NodeIdentifier};
use crate::config::ProtocolConfig;
use crate::driver::{with_timeout, ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::supervisor::ConnectionSupervisor;
use crate::value::{DataType, PlcValue};

/// Callback invoked for each data-change notification. Runs on its own
/// task; it may take its time without stalling the session.
pub type DataChangeHandler = Arc<dyn Fn(NodeId, PlcValue) + Send + Sync>;

/// Map a service-level status code into the gateway taxonomy. The upper
/// half of the code carries the identifying severity/subcode bits.
fn status_error(operation: &str, status: StatusCode) -> GatewayError {
    GatewayError::communication(operation, (status.bits() >> 16) as u16)
}

struct OpcUaLink {
    session: Arc<Session>,
    event_loop: tokio::task::JoinHandle<StatusCode>,
    /// Server namespace array: uri → index.
    namespaces: HashMap<String, u16>,
}

/// OPC UA protocol driver.
pub struct OpcUaDriver {
    supervisor: Arc<ConnectionSupervisor>,
    link: tokio::sync::Mutex<Option<OpcUaLink>>,
    self_ref: Weak<OpcUaDriver>,
}

impl OpcUaDriver {
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| OpcUaDriver {
            supervisor: Arc::new(ConnectionSupervisor::new(config)),
            link: tokio::sync::Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    fn config(&self) -> &ProtocolConfig {
        self.supervisor.config()
    }

    fn endpoint_url(&self) -> String {
        let config = self.config();
        format!("opc.tcp://{}:{}", config.host, config.port)
    }

    /// Resolve an address string to a NodeId using the namespace map.
    ///
    /// Bare symbolic names (namespace 0 from the resolver) are looked up
    /// in the configured namespace URI when the server exposes it.
    fn to_node_id(
        &self,
        address: &str,
        namespaces: &HashMap<String, u16>,
    ) -> GatewayResult<NodeId> {
        let resolved = Address::parse(address)?;
        match resolved {
            Address::OpcUaNode {
                namespace,
                identifier,
            } => {
                // Bare tag names land in the configured namespace when
                // the server exposes it; numeric ids keep namespace 0.
                let ns = match (&identifier, namespace) {
                    (NodeIdentifier::Text(_), 0) => namespaces
                        .get(&self.config().namespace_uri)
                        .copied()
                        .unwrap_or(0),
                    _ => namespace,
                };
                Ok(match identifier {
                    NodeIdentifier::Numeric(id) => NodeId::new(ns, id),
                    NodeIdentifier::Text(name) => NodeId::new(ns, name),
                })
            }
            _ => Err(GatewayError::address(
                address,
                "not an OPC UA node identifier",
            )),
        }
    }

    /// Choose the variant type for an outgoing value.
    fn to_variant(value: &PlcValue, data_type: DataType) -> GatewayResult<Variant> {
        Ok(match data_type {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
                Variant::Boolean(value.as_bool())
            }
            DataType::UInt8 => Variant::Byte(value.convert(data_type)?.as_u64() as u8),
            DataType::Int8 => Variant::SByte(value.convert(data_type)?.as_i64() as i8),
            DataType::UInt16 | DataType::HoldingRegister | DataType::InputRegister => {
                Variant::UInt16(value.convert(data_type)?.as_u64() as u16)
            }
            DataType::Int16 => Variant::Int16(value.convert(data_type)?.as_i64() as i16),
            DataType::UInt32 => Variant::UInt32(value.convert(data_type)?.as_u64() as u32),
            DataType::Int32 => Variant::Int32(value.convert(data_type)?.as_i64() as i32),
            DataType::Float32 => Variant::Float(value.as_f64() as f32),
            DataType::Float64 => Variant::Double(value.as_f64()),
            DataType::Str => Variant::String(value.to_string().into()),
        })
    }

    /// Coerce a received variant to the requested data type.
    ///
    /// Lossy narrowings (e.g. Double → Int16) are reported as data errors
    /// through the error listeners while the best-effort scalar is still
    /// returned.
    fn from_variant(&self, variant: &Variant, data_type: DataType) -> PlcValue {
        let raw = match variant {
            Variant::Boolean(v) => PlcValue::Bool(*v),
            Variant::Byte(v) => PlcValue::UInt(*v as u64),
            Variant::SByte(v) => PlcValue::Int(*v as i64),
            Variant::UInt16(v) => PlcValue::UInt(*v as u64),
            Variant::Int16(v) => PlcValue::Int(*v as i64),
            Variant::UInt32(v) => PlcValue::UInt(*v as u64),
            Variant::Int32(v) => PlcValue::Int(*v as i64),
            Variant::UInt64(v) => PlcValue::UInt(*v),
            Variant::Int64(v) => PlcValue::Int(*v),
            Variant::Float(v) => PlcValue::Float(*v as f64),
            Variant::Double(v) => PlcValue::Float(*v),
            Variant::String(v) => PlcValue::Str(v.as_ref().to_string()),
            other => PlcValue::Str(format!("{:?}", other)),
        };

        match raw.convert(data_type) {
            Ok(converted) => converted,
            Err(e) => {
                // Unambiguous scalar narrowing still yields a value.
                self.supervisor.notify_error(&GatewayError::data(format!(
                    "Coercion loss reading {}: {}",
                    data_type, e
                )));
                match data_type {
                    DataType::Float32 | DataType::Float64 => PlcValue::Float(raw.as_f64()),
                    DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
                        PlcValue::Bool(raw.as_bool())
                    }
                    DataType::Int8 | DataType::Int16 | DataType::Int32 => {
                        PlcValue::Int(raw.as_i64())
                    }
                    _ => PlcValue::UInt(raw.as_u64()),
                }
            }
        }
    }

    async fn read_nodes(
        &self,
        requests: &[ReadRequest],
    ) -> GatewayResult<Vec<GatewayResult<Vec<PlcValue>>>> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        let mut nodes = Vec::with_capacity(requests.len());
        let mut resolution: Vec<GatewayResult<()>> = Vec::with_capacity(requests.len());
        for request in requests {
            match self.to_node_id(&request.address, &link.namespaces) {
                Ok(node_id) => {
                    nodes.push(ReadValueId::from(node_id));
                    resolution.push(Ok(()));
                }
                Err(e) => resolution.push(Err(e)),
            }
        }

        let read_results = if nodes.is_empty() {
            Vec::new()
        } else {
            link.session
                .read(&nodes, TimestampsToReturn::Neither, 0.0)
                .await
                .map_err(|s| status_error("read", s))?
        };

        let mut values = read_results.into_iter();
        let mut out = Vec::with_capacity(requests.len());
        for (request, resolved) in requests.iter().zip(resolution) {
            match resolved {
                Err(e) => out.push(Err(e)),
                Ok(()) => {
                    let data_value: DataValue = values.next().unwrap_or_default();
                    if let Some(status) = data_value.status {
                        if status.is_bad() {
                            out.push(Err(status_error("read", status)));
                            continue;
                        }
                    }
                    match data_value.value {
                        Some(variant) => {
                            out.push(Ok(vec![self.from_variant(&variant, request.data_type)]))
                        }
                        None => out.push(Err(GatewayError::data(format!(
                            "Node {} returned no value",
                            request.address
                        )))),
                    }
                }
            }
        }
        Ok(out)
    }

    async fn write_nodes(
        &self,
        requests: &[WriteRequest],
    ) -> GatewayResult<Vec<GatewayResult<()>>> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        let mut writes = Vec::with_capacity(requests.len());
        let mut resolution: Vec<GatewayResult<()>> = Vec::with_capacity(requests.len());
        for request in requests {
            let prepared = self
                .to_node_id(&request.address, &link.namespaces)
                .and_then(|node_id| {
                    Self::to_variant(&request.value, request.data_type).map(|v| (node_id, v))
                });
            match prepared {
                Ok((node_id, variant)) => {
                    writes.push(WriteValue {
                        node_id,
                        attribute_id: AttributeId::Value as u32,
                        index_range: Default::default(),
                        value: DataValue {
                            value: Some(variant),
                            ..Default::default()
                        },
                    });
                    resolution.push(Ok(()));
                }
                Err(e) => resolution.push(Err(e)),
            }
        }

        let statuses = if writes.is_empty() {
            Vec::new()
        } else {
            link.session
                .write(&writes)
                .await
                .map_err(|s| status_error("write", s))?
        };

        let mut statuses = statuses.into_iter();
        let mut out = Vec::with_capacity(requests.len());
        for resolved in resolution {
            match resolved {
                Err(e) => out.push(Err(e)),
                Ok(()) => {
                    let status = statuses.next().unwrap_or(StatusCode::Good);
                    if status.is_bad() {
                        out.push(Err(status_error("write", status)));
                    } else {
                        out.push(Ok(()));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Subscribe to data changes on `addresses`.
    ///
    /// Creates one subscription with the given publish interval and one
    /// monitored item per node. Notifications are forwarded through an
    /// unbounded channel to a dedicated task that runs `handler`, so the
    /// handler cannot block the session.
    pub async fn subscribe(
        &self,
        addresses: &[String],
        handler: DataChangeHandler,
        publish_interval_ms: u64,
    ) -> GatewayResult<u32> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        let mut node_ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            node_ids.push(self.to_node_id(address, &link.namespaces)?);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, DataValue)>();
        tokio::spawn(async move {
            while let Some((node_id, data_value)) = rx.recv().await {
                let value = match data_value.value {
                    Some(Variant::Boolean(v)) => PlcValue::Bool(v),
                    Some(Variant::Float(v)) => PlcValue::Float(v as f64),
                    Some(Variant::Double(v)) => PlcValue::Float(v),
                    Some(Variant::Int16(v)) => PlcValue::Int(v as i64),
                    Some(Variant::Int32(v)) => PlcValue::Int(v as i64),
                    Some(Variant::Int64(v)) => PlcValue::Int(v),
                    Some(Variant::Byte(v)) => PlcValue::UInt(v as u64),
                    Some(Variant::UInt16(v)) => PlcValue::UInt(v as u64),
                    Some(Variant::UInt32(v)) => PlcValue::UInt(v as u64),
                    Some(Variant::UInt64(v)) => PlcValue::UInt(v),
                    Some(Variant::String(v)) => PlcValue::Str(v.as_ref().to_string()),
                    Some(other) => PlcValue::Str(format!("{:?}", other)),
                    None => continue,
                };
                handler(node_id, value);
            }
        });

        let subscription_id = link
            .session
            .create_subscription(
                Duration::from_millis(publish_interval_ms.max(1)),
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(move |value, item| {
                    let _ = tx.send((item.item_to_monitor().node_id.clone(), value));
                }),
            )
            .await
            .map_err(|s| status_error("create_subscription", s))?;

        let items: Vec<MonitoredItemCreateRequest> =
            node_ids.into_iter().map(|id| id.into()).collect();
        link.session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, items)
            .await
            .map_err(|s| status_error("create_monitored_items", s))?;

        debug!(subscription_id, "subscription established");
        Ok(subscription_id)
    }

    /// Tear down a subscription created by [`subscribe`].
    ///
    /// [`subscribe`]: OpcUaDriver::subscribe
    pub async fn unsubscribe(&self, subscription_id: u32) -> GatewayResult<()> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;
        link.session
            .delete_subscription(subscription_id)
            .await
            .map_err(|s| status_error("delete_subscription", s))?;
        Ok(())
    }

    /// Read the server namespace array into a uri → index map.
    async fn load_namespaces(session: &Arc<Session>) -> HashMap<String, u16> {
        let node: NodeId = VariableId::Server_NamespaceArray.into();
        let mut map = HashMap::new();

        match session
            .read(&[ReadValueId::from(node)], TimestampsToReturn::Neither, 0.0)
            .await
        {
            Ok(results) => {
                if let Some(Variant::Array(array)) =
                    results.into_iter().next().and_then(|dv| dv.value)
                {
                    for (index, entry) in array.values.iter().enumerate() {
                        if let Variant::String(uri) = entry {
                            map.insert(uri.as_ref().to_string(), index as u16);
                        }
                    }
                }
            }
            Err(status) => {
                warn!(%status, "failed to read server namespace array");
            }
        }
        map
    }
}

#[async_trait]
impl ProtocolDriver for OpcUaDriver {
    async fn connect(&self) -> GatewayResult<()> {
        if !self.supervisor.begin_connect() {
            return Ok(());
        }
        let config = self.config().clone();
        let url = self.endpoint_url();

        let result: GatewayResult<OpcUaLink> = async {
            let mut client = ClientBuilder::new()
                .application_name("fieldgate")
                .application_uri("urn:fieldgate")
                .product_uri("urn:fieldgate")
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(0)
                .session_timeout(config.timeout_ms as u32)
                .client()
                .map_err(|e| {
                    GatewayError::configuration(format!("OPC UA client config: {:?}", e))
                })?;

            let (session, event_loop) = client
                .connect_to_matching_endpoint((
                    url.as_str(),
                    SecurityPolicy::None.to_str(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ), IdentityToken::Anonymous)
                .await
                .map_err(|s| status_error("connect", s))?;

            let handle = event_loop.spawn();
            if !session.wait_for_connection().await {
                handle.abort();
                return Err(GatewayError::connection(format!(
                    "OPC UA session to {} never became active",
                    url
                )));
            }

            let namespaces = Self::load_namespaces(&session).await;
            debug!(count = namespaces.len(), "namespace array loaded");

            Ok(OpcUaLink {
                session,
                event_loop: handle,
                namespaces,
            })
        }
        .await;

        match result {
            Ok(link) => {
                *self.link.lock().await = Some(link);
                self.supervisor.mark_connected();
                info!(endpoint = %url, "OPC UA session active");
                let weak: Weak<dyn ProtocolDriver> = self.self_ref.clone();
                Arc::clone(&self.supervisor).ensure_heartbeat(weak);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %url, error = %e, "OPC UA connect failed");
                self.supervisor.mark_error();
                self.supervisor.notify_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.supervisor.stop_heartbeat();
        if let Some(link) = self.link.lock().await.take() {
            link.session.disconnect().await.ok();
            link.event_loop.abort();
        }
        self.supervisor.mark_disconnected();
        debug!("OPC UA disconnected");
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        let started = std::time::Instant::now();
        let result = with_timeout(request.timeout_ms, "read", async {
            let mut results = self.read_nodes(std::slice::from_ref(request)).await?;
            results.remove(0)
        })
        .await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }

    async fn write(&self, request: &WriteRequest) -> GatewayResult<()> {
        let started = std::time::Instant::now();
        let result = with_timeout(request.timeout_ms, "write", async {
            let mut results = self.write_nodes(std::slice::from_ref(request)).await?;
            results.remove(0)
        })
        .await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }

    /// Batched read: one Read service call for all resolvable nodes.
    async fn read_many(
        &self,
        requests: &[ReadRequest],
    ) -> Vec<GatewayResult<Vec<PlcValue>>> {
        match self.read_nodes(requests).await {
            Ok(results) => results,
            Err(e) => requests.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    /// Batched write: one Write service call for all resolvable nodes.
    async fn write_many(&self, requests: &[WriteRequest]) -> Vec<GatewayResult<()>> {
        match self.write_nodes(requests).await {
            Ok(results) => results,
            Err(e) => requests.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    async fn ping(&self) -> bool {
        let request = ReadRequest::new("i=2259", 1, DataType::Int32); // ServerStatus_State
        match self.read_nodes(std::slice::from_ref(&request)).await {
            Ok(results) => results.first().map(|r| r.is_ok()).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}
