//! Ethernet/IP driver with CIP session semantics.
//!
//! Two-phase session: after the TCP connect, a RegisterSession command
//! (0x0065) with a zero handle is the first frame on the wire; the reply
//! carries the 32-bit session handle at bytes 4..8, and every subsequent
//! encapsulation header repeats it. UnRegisterSession (0x0066) precedes
//! the socket close. Tag access uses CIP Read Tag (0x4C) and Write Tag
//! (0x4D) carried in SendRRData with a null-address + unconnected-data
//! item pair. Encapsulation and CIP framing are little-endian; tag
//! payloads use the gateway's big-endian codec.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ProtocolConfig;
use crate::driver::{with_timeout, ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::supervisor::ConnectionSupervisor;
use crate::value::{DataType, PlcValue};

// Encapsulation commands.
pub const CMD_LIST_IDENTITY: u16 = 0x0063;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;

/// Encapsulation header length.
pub const ENCAP_HEADER_LEN: usize = 24;

// CIP services.
const SERVICE_READ_TAG: u8 = 0x4C;
const SERVICE_WRITE_TAG: u8 = 0x4D;

// CPF item types.
const ITEM_NULL_ADDRESS: u16 = 0x0000;
const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// CIP elementary type code for a data type.
fn cip_type_code(data_type: DataType) -> GatewayResult<u16> {
    Ok(match data_type {
        DataType::Bool | DataType::Coil | DataType::DiscreteInput => 0x00C1,
        DataType::Int8 => 0x00C2,
        DataType::Int16 => 0x00C3,
        DataType::Int32 => 0x00C4,
        DataType::UInt8 => 0x00C6,
        DataType::UInt16 | DataType::HoldingRegister | DataType::InputRegister => 0x00C7,
        DataType::UInt32 => 0x00C8,
        DataType::Float32 => 0x00CA,
        DataType::Float64 => 0x00CB,
        DataType::Str => 0x00D0,
    })
}

/// Build an encapsulation frame: 24-byte little-endian header + data.
fn encap_frame(command: u16, session_handle: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(ENCAP_HEADER_LEN + data.len());
    frame.put_u16_le(command);
    frame.put_u16_le(data.len() as u16);
    frame.put_u32_le(session_handle);
    frame.put_u32_le(0); // status
    frame.put_slice(&[0u8; 8]); // sender context
    frame.put_u32_le(0); // options
    frame.put_slice(data);
    frame.to_vec()
}

/// Build a CIP request path from an address.
///
/// Symbolic: ANSI extended symbol segment `0x91, len, name…`, padded to
/// an even length. Numeric: class 0x6B instance path `0x20, 0x24, hi, lo`.
fn build_cip_path(address: &str) -> GatewayResult<Vec<u8>> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::address(address, "empty tag path"));
    }

    if let Ok(instance) = trimmed.parse::<u16>() {
        return Ok(vec![
            0x20,
            0x24,
            (instance >> 8) as u8,
            (instance & 0xFF) as u8,
        ]);
    }

    if trimmed.len() > u8::MAX as usize {
        return Err(GatewayError::address(address, "tag name too long"));
    }
    let mut path = Vec::with_capacity(2 + trimmed.len() + 1);
    path.push(0x91);
    path.push(trimmed.len() as u8);
    path.extend_from_slice(trimmed.as_bytes());
    if path.len() % 2 != 0 {
        path.push(0x00);
    }
    Ok(path)
}

/// Wrap a CIP message in SendRRData command data (interface handle,
/// timeout, CPF with null address + unconnected data items).
fn send_rr_data(cip: &[u8]) -> Vec<u8> {
    let mut data = BytesMut::with_capacity(16 + cip.len());
    data.put_u32_le(0); // interface handle: CIP
    data.put_u16_le(10); // timeout in seconds
    data.put_u16_le(2); // item count
    data.put_u16_le(ITEM_NULL_ADDRESS);
    data.put_u16_le(0);
    data.put_u16_le(ITEM_UNCONNECTED_DATA);
    data.put_u16_le(cip.len() as u16);
    data.put_slice(cip);
    data.to_vec()
}

/// Ethernet/IP transport: encapsulation framing over one TCP stream.
struct EipTransport {
    stream: TcpStream,
    timeout: Duration,
    session_handle: u32,
}

impl EipTransport {
    async fn connect(host: &str, port: u16, timeout: Duration) -> GatewayResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatewayError::timeout("connect", timeout.as_millis() as u64))?
            .map_err(|e| GatewayError::connection(format!("TCP connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();

        let mut transport = EipTransport {
            stream,
            timeout,
            session_handle: 0,
        };
        transport.register_session().await?;
        Ok(transport)
    }

    /// Exchange one encapsulation frame; returns header + data.
    async fn exchange(&mut self, frame: &[u8]) -> GatewayResult<Vec<u8>> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.exchange_inner(frame))
            .await
            .map_err(|_| GatewayError::timeout("exchange", timeout.as_millis() as u64))?
    }

    async fn exchange_inner(&mut self, frame: &[u8]) -> GatewayResult<Vec<u8>> {
        self.stream.write_all(frame).await?;

        let mut header = [0u8; ENCAP_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let status = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if status != 0 {
            return Err(GatewayError::communication("encapsulation", status as u16));
        }

        let mut response = header.to_vec();
        if length > 0 {
            let mut body = vec![0u8; length];
            self.stream.read_exact(&mut body).await?;
            response.extend_from_slice(&body);
        }
        Ok(response)
    }

    /// RegisterSession: protocol version 1, options 0. The reply's bytes
    /// 4..8 become the session handle for every later frame.
    async fn register_session(&mut self) -> GatewayResult<()> {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16_le(1); // protocol version
        data.put_u16_le(0); // options
        let frame = encap_frame(CMD_REGISTER_SESSION, 0, &data);

        let response = self.exchange(&frame).await?;
        if response.len() < ENCAP_HEADER_LEN {
            return Err(GatewayError::protocol("Short RegisterSession reply"));
        }
        self.session_handle =
            u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
        if self.session_handle == 0 {
            return Err(GatewayError::protocol("Peer returned a zero session handle"));
        }
        debug!(session = self.session_handle, "Ethernet/IP session registered");
        Ok(())
    }

    /// UnRegisterSession; the peer closes without replying.
    async fn unregister_session(&mut self) -> GatewayResult<()> {
        let frame = encap_frame(CMD_UNREGISTER_SESSION, self.session_handle, &[]);
        self.stream.write_all(&frame).await?;
        self.session_handle = 0;
        Ok(())
    }

    /// Send a CIP request via SendRRData and return the CIP reply bytes.
    async fn cip_request(&mut self, cip: &[u8]) -> GatewayResult<Vec<u8>> {
        let frame = encap_frame(CMD_SEND_RR_DATA, self.session_handle, &send_rr_data(cip));
        let response = self.exchange(&frame).await?;

        // Header + interface handle (4) + timeout (2) + item count (2)
        // + null item (4) + data item type/len (4).
        let body = &response[ENCAP_HEADER_LEN..];
        if body.len() < 16 {
            return Err(GatewayError::protocol("Short SendRRData reply"));
        }
        let item_count = u16::from_le_bytes([body[6], body[7]]);
        if item_count < 2 {
            return Err(GatewayError::protocol("Missing CPF items in reply"));
        }
        let item_type = u16::from_le_bytes([body[12], body[13]]);
        if item_type != ITEM_UNCONNECTED_DATA {
            return Err(GatewayError::protocol(format!(
                "Unexpected CPF item type {:#06x}",
                item_type
            )));
        }
        let item_len = u16::from_le_bytes([body[14], body[15]]) as usize;
        if body.len() < 16 + item_len {
            return Err(GatewayError::protocol("Truncated CPF data item"));
        }
        Ok(body[16..16 + item_len].to_vec())
    }

    async fn close(&mut self) {
        self.unregister_session().await.ok();
        self.stream.shutdown().await.ok();
    }
}

/// Decode a CIP reply: check the general status, return the payload
/// following the 2-byte type code.
fn parse_cip_reply(reply: &[u8], operation: &str) -> GatewayResult<Vec<u8>> {
    if reply.len() < 4 {
        return Err(GatewayError::protocol("Short CIP reply"));
    }
    let status = reply[2];
    let additional = reply[3] as usize;
    if status != 0 {
        return Err(GatewayError::communication(operation, status as u16));
    }
    let data_start = 4 + additional * 2;
    if reply.len() < data_start {
        return Err(GatewayError::protocol("Truncated CIP additional status"));
    }
    Ok(reply[data_start..].to_vec())
}

/// Ethernet/IP driver.
pub struct EipDriver {
    supervisor: Arc<ConnectionSupervisor>,
    transport: tokio::sync::Mutex<Option<EipTransport>>,
    self_ref: Weak<EipDriver>,
}

impl EipDriver {
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| EipDriver {
            supervisor: Arc::new(ConnectionSupervisor::new(config)),
            transport: tokio::sync::Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    fn config(&self) -> &ProtocolConfig {
        self.supervisor.config()
    }

    async fn read_inner(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        let path = build_cip_path(&request.address)?;
        let count = request.count.max(1);

        let mut cip = BytesMut::with_capacity(2 + path.len() + 2);
        cip.put_u8(SERVICE_READ_TAG);
        cip.put_u8((path.len() / 2) as u8);
        cip.put_slice(&path);
        cip.put_u16_le(count as u16);

        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;
        let reply = transport.cip_request(&cip).await?;
        drop(guard);

        let payload = parse_cip_reply(&reply, "read_tag")?;
        // Skip the 2-byte CIP type code ahead of the element data.
        let data = if payload.len() >= 2 { &payload[2..] } else { &[][..] };
        let (values, short_fall) = codec::decode(data, request.data_type, count);
        if short_fall > 0 {
            self.supervisor
                .notify_error(&GatewayError::data("Decode underflow on tag read"));
            self.supervisor.record(false, 0.0);
        }
        Ok(values)
    }

    async fn write_inner(&self, request: &WriteRequest) -> GatewayResult<()> {
        let path = build_cip_path(&request.address)?;
        let data = codec::encode(&request.value, request.data_type)?;
        let type_code = cip_type_code(request.data_type)?;

        let mut cip = BytesMut::with_capacity(2 + path.len() + 4 + data.len());
        cip.put_u8(SERVICE_WRITE_TAG);
        cip.put_u8((path.len() / 2) as u8);
        cip.put_slice(&path);
        cip.put_u16_le(type_code);
        cip.put_u16_le(1); // element count
        cip.put_slice(&data);

        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;
        let reply = transport.cip_request(&cip).await?;
        drop(guard);

        parse_cip_reply(&reply, "write_tag")?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for EipDriver {
    async fn connect(&self) -> GatewayResult<()> {
        if !self.supervisor.begin_connect() {
            return Ok(());
        }
        let config = self.config().clone();

        let result = EipTransport::connect(
            &config.host,
            config.port,
            Duration::from_millis(config.timeout_ms),
        )
        .await;

        match result {
            Ok(transport) => {
                *self.transport.lock().await = Some(transport);
                self.supervisor.mark_connected();
                info!(host = %config.host, "Ethernet/IP connected");
                let weak: Weak<dyn ProtocolDriver> = self.self_ref.clone();
                Arc::clone(&self.supervisor).ensure_heartbeat(weak);
                Ok(())
            }
            Err(e) => {
                warn!(host = %config.host, error = %e, "Ethernet/IP connect failed");
                self.supervisor.mark_error();
                self.supervisor.notify_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.supervisor.stop_heartbeat();
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
        self.supervisor.mark_disconnected();
        debug!("Ethernet/IP disconnected");
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        let started = std::time::Instant::now();
        let result = with_timeout(request.timeout_ms, "read", self.read_inner(request)).await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }

    async fn write(&self, request: &WriteRequest) -> GatewayResult<()> {
        let started = std::time::Instant::now();
        let result = with_timeout(request.timeout_ms, "write", self.write_inner(request)).await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }

    async fn ping(&self) -> bool {
        // ListIdentity is session-less and answered by every target.
        let mut guard = self.transport.lock().await;
        let Some(transport) = guard.as_mut() else {
            return false;
        };
        let frame = encap_frame(CMD_LIST_IDENTITY, transport.session_handle, &[]);
        transport.exchange(&frame).await.is_ok()
    }

    fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}
