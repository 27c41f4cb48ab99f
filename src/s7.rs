//! S7 protocol driver (ISO-on-TCP).
//!
//! Speaks the S7 request/response telegrams over [`IsoTcpTransport`]:
//! area reads and writes (function 4/5), CPU state query, and SZL reads
//! for module identification. Symbolic addresses (`I0.0`, `DB1.DBW0`)
//! resolve through the address module; bare numeric addresses default to
//! the DB area at DB 0.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::{Address, MemoryArea};
use crate::codec;
use crate::config::ProtocolConfig;
use crate::driver::{
    with_timeout, CpuInfo, PlcRunState, ProtocolDriver, ReadRequest, WriteRequest,
};
use crate::error::{GatewayError, GatewayResult};
use crate::iso_tcp::{ConnectionType, IsoTcpTransport};
use crate::supervisor::ConnectionSupervisor;
use crate::value::{DataType, PlcValue};

// S7 transport sizes (word lengths).
const WL_BYTE: u8 = 0x02;
const WL_COUNTER: u8 = 0x1C;
const WL_TIMER: u8 = 0x1D;

// Result transport sizes for write telegrams.
const TS_RES_BYTE: u8 = 4;
const TS_RES_OCTET: u8 = 9;

/// Header length of a read request / reply telegram.
const SIZE_HEADER_READ: usize = 31;
/// Header length of a write request telegram.
const SIZE_HEADER_WRITE: usize = 35;

/// S7 read/write request header (TPKT + COTP + S7). Fields are patched
/// before sending; see the byte comments.
const READ_WRITE_TELEGRAM: [u8; 35] = [
    3, 0, 0, 31, // TPKT, total length patched for writes
    2, 240, 128, // COTP data header
    50,  // S7 protocol id
    1,   // job
    0, 0, // redundancy id
    5, 0, // PDU reference
    0, 14, // parameter length
    0, 0, // data length, patched for writes
    4,  // function: 4 read, 5 write
    1,  // item count
    18, // variable specification
    10, // length of remaining spec
    16, // syntax id: S7ANY
    WL_BYTE, // transport size, idx 22
    0, 0, // element count, idx 23
    0, 0, // DB number, idx 25
    0x84, // area code, idx 27
    0, 0, 0, // 3-byte start address, idx 28
    // Write-only tail:
    0,          // reserved
    TS_RES_BYTE, // transport size
    0, 0, // payload length in bits
];

/// CPU state query telegram; the state byte is at offset 44 of the reply.
const PLC_STATUS_TELEGRAM: [u8; 33] = [
    3, 0, 0, 33, 2, 240, 128, 50, 7, 0, 0, 44, 0, 0, 8, 0, 8, 0, 1, 18, 4, 17, 68, 1, 0, 255, 9,
    0, 4, 4, 36, 0, 0,
];

/// First SZL read telegram; SZL id at 29..31, index at 31..33.
const SZL_FIRST_TELEGRAM: [u8; 33] = [
    3, 0, 0, 33, 2, 240, 128, 50, 7, 0, 0, 5, 0, 0, 8, 0, 8, 0, 1, 18, 4, 17, 68, 1, 0, 255, 9,
    0, 4, 0, 0, 0, 0,
];

/// Minimum length of a useful first SZL reply.
const MIN_SZL_RESPONSE: usize = 42;

const CPU_STATUS_RUN: u8 = 0x08;
const CPU_STATUS_STOP: u8 = 0x04;

/// A resolved S7 access: area, DB number, byte offset, optional bit.
#[derive(Debug, Clone, Copy, PartialEq)]
struct S7Access {
    area: MemoryArea,
    db_number: u16,
    byte: u32,
    bit: Option<u8>,
    /// Element width implied by the address form, if any.
    width: Option<u8>,
}

/// S7 driver; also the transport core for the Profibus-DP driver.
pub struct S7Driver {
    supervisor: Arc<ConnectionSupervisor>,
    transport: Mutex<Option<IsoTcpTransport>>,
    conn_type: ConnectionType,
    rack: u16,
    slot: u16,
    self_ref: Weak<S7Driver>,
}

impl S7Driver {
    /// Create a driver from configuration; `rack`/`slot` come from config.
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        let rack = config.rack;
        let slot = config.slot;
        Self::with_endpoint(config, rack, slot, ConnectionType::Pg)
    }

    /// Shared constructor; Profibus-DP forces rack/slot 0/0 and the basic
    /// connection type.
    pub(crate) fn with_endpoint(
        config: ProtocolConfig,
        rack: u16,
        slot: u16,
        conn_type: ConnectionType,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| S7Driver {
            supervisor: Arc::new(ConnectionSupervisor::new(config)),
            transport: Mutex::new(None),
            conn_type,
            rack,
            slot,
            self_ref: weak.clone(),
        })
    }

    fn config(&self) -> &ProtocolConfig {
        self.supervisor.config()
    }

    /// Resolve a request address into an S7 access path.
    ///
    /// Bare numeric addresses default to the DB area (DB 0), mirroring
    /// the offset-based access mode of the uniform contract.
    fn resolve(&self, address: &str) -> GatewayResult<S7Access> {
        if let Ok(byte) = address.trim().parse::<u32>() {
            return Ok(S7Access {
                area: MemoryArea::Db,
                db_number: 0,
                byte,
                bit: None,
                width: None,
            });
        }

        let resolved = Address::parse(address)?;
        let access = match resolved {
            Address::Bit { area, byte, bit } => S7Access {
                area,
                db_number: 0,
                byte,
                bit: Some(bit),
                width: Some(1),
            },
            Address::Byte { area, byte } => S7Access {
                area,
                db_number: 0,
                byte,
                bit: None,
                width: Some(1),
            },
            Address::Word { area, byte } => S7Access {
                area,
                db_number: 0,
                byte,
                bit: None,
                width: Some(2),
            },
            Address::DWord { area, byte } => S7Access {
                area,
                db_number: 0,
                byte,
                bit: None,
                width: Some(4),
            },
            Address::Db {
                db_number,
                byte,
                width,
                bit,
            } => S7Access {
                area: MemoryArea::Db,
                db_number,
                byte,
                bit,
                width: Some(width),
            },
            Address::Timer { number } => S7Access {
                area: MemoryArea::Tm,
                db_number: 0,
                byte: number as u32,
                bit: None,
                width: Some(2),
            },
            Address::Counter { number } => S7Access {
                area: MemoryArea::Ct,
                db_number: 0,
                byte: number as u32,
                bit: None,
                width: Some(2),
            },
            Address::OpcUaNode { .. } => {
                return Err(GatewayError::address(
                    address,
                    format!("not addressable over {}", self.config().protocol_kind),
                ))
            }
        };
        Ok(access)
    }

    /// Bytes a request occupies on the wire.
    fn request_length(access: &S7Access, data_type: DataType, count: usize) -> usize {
        if access.bit.is_some() {
            return 1;
        }
        match data_type {
            DataType::Str => codec::S7_STRING_CAPACITY + 2,
            _ => {
                let type_width = data_type.width_bytes();
                // An explicit address width (e.g. DBW) wins over the
                // data type for single-element access.
                let width = match access.width {
                    Some(w) if count == 1 => (w as usize).max(type_width),
                    _ => type_width.max(1),
                };
                width * count.max(1)
            }
        }
    }

    fn word_len_for(area: MemoryArea) -> u8 {
        match area {
            MemoryArea::Ct => WL_COUNTER,
            MemoryArea::Tm => WL_TIMER,
            _ => WL_BYTE,
        }
    }

    /// Read raw bytes from an area. Chunks by the negotiated PDU length.
    async fn read_area(
        &self,
        transport: &mut IsoTcpTransport,
        access: &S7Access,
        length_bytes: usize,
    ) -> GatewayResult<Vec<u8>> {
        let word_len = Self::word_len_for(access.area);
        let word_size: usize = match word_len {
            WL_COUNTER | WL_TIMER => 2,
            _ => 1,
        };
        // Counters and timers address elements, everything else bytes.
        let total_elements = if word_size == 2 {
            length_bytes.div_ceil(2)
        } else {
            length_bytes
        };

        let pdu_length = transport.pdu_length() as usize;
        let max_elements = (pdu_length - 18) / word_size;

        let mut out = Vec::with_capacity(length_bytes);
        let mut start = access.byte as usize;
        let mut remaining = total_elements;

        while remaining > 0 {
            let num_elements = remaining.min(max_elements);

            let mut request = READ_WRITE_TELEGRAM[..SIZE_HEADER_READ].to_vec();
            request[22] = word_len;
            request[23..25].copy_from_slice(&(num_elements as u16).to_be_bytes());
            request[25..27].copy_from_slice(&access.db_number.to_be_bytes());
            request[27] = access.area.code();

            // Byte access addresses bits on the wire.
            let address = match word_len {
                WL_COUNTER | WL_TIMER => start,
                _ => start << 3,
            };
            request[28] = ((address >> 16) & 0xFF) as u8;
            request[29] = ((address >> 8) & 0xFF) as u8;
            request[30] = (address & 0xFF) as u8;

            let response = transport.exchange(&request).await?;
            if response.len() < 25 {
                return Err(GatewayError::protocol("Short S7 read reply"));
            }
            if response[21] != 0xFF {
                return Err(GatewayError::communication("read_area", response[21] as u16));
            }

            let payload = num_elements * word_size;
            let end = (25 + payload).min(response.len());
            out.extend_from_slice(&response[25..end]);

            remaining -= num_elements;
            start += num_elements * word_size;
        }

        out.truncate(length_bytes);
        Ok(out)
    }

    /// Write raw bytes into an area. Chunks by the negotiated PDU length.
    async fn write_area(
        &self,
        transport: &mut IsoTcpTransport,
        access: &S7Access,
        data: &[u8],
    ) -> GatewayResult<()> {
        if access.area.is_read_only() {
            return Err(GatewayError::address(
                format!("{:?}", access.area),
                "area is read-only",
            ));
        }

        let word_len = Self::word_len_for(access.area);
        let word_size: usize = match word_len {
            WL_COUNTER | WL_TIMER => 2,
            _ => 1,
        };

        let pdu_length = transport.pdu_length() as usize;
        let max_bytes = pdu_length - SIZE_HEADER_WRITE;

        let mut offset = 0usize;
        let mut start = access.byte as usize;

        while offset < data.len() {
            let chunk = &data[offset..(offset + max_bytes).min(data.len())];
            let data_size = chunk.len();
            let num_elements = data_size / word_size;
            let iso_size = SIZE_HEADER_WRITE + data_size;

            let mut request = READ_WRITE_TELEGRAM.to_vec();
            request[2..4].copy_from_slice(&(iso_size as u16).to_be_bytes());
            request[15..17].copy_from_slice(&((data_size + 4) as u16).to_be_bytes());
            request[17] = 0x05; // write
            request[22] = word_len;
            request[23..25].copy_from_slice(&(num_elements as u16).to_be_bytes());
            request[25..27].copy_from_slice(&access.db_number.to_be_bytes());
            request[27] = access.area.code();

            let (address, bit_length, transport_size) = match word_len {
                WL_COUNTER | WL_TIMER => (start, data_size, TS_RES_OCTET),
                _ => (start << 3, data_size << 3, TS_RES_BYTE),
            };
            request[28] = ((address >> 16) & 0xFF) as u8;
            request[29] = ((address >> 8) & 0xFF) as u8;
            request[30] = (address & 0xFF) as u8;
            request[32] = transport_size;
            request[33..35].copy_from_slice(&(bit_length as u16).to_be_bytes());
            request.extend_from_slice(chunk);

            let response = transport.exchange(&request).await?;
            if response.len() < 22 {
                return Err(GatewayError::protocol("Short S7 write reply"));
            }
            if response[21] != 0xFF {
                return Err(GatewayError::communication(
                    "write_area",
                    response[21] as u16,
                ));
            }

            offset += data_size;
            start += num_elements * word_size;
        }
        Ok(())
    }

    /// Read-modify-write of a single bit within its byte.
    async fn write_bit(
        &self,
        transport: &mut IsoTcpTransport,
        access: &S7Access,
        bit: u8,
        value: bool,
    ) -> GatewayResult<()> {
        let current = self.read_area(transport, access, 1).await?;
        let mut byte = current.first().copied().unwrap_or(0);
        if value {
            byte |= 1 << bit;
        } else {
            byte &= !(1 << bit);
        }
        self.write_area(transport, access, &[byte]).await
    }

    async fn exchange_control(&self, telegram: &[u8]) -> GatewayResult<Vec<u8>> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;
        transport.exchange(telegram).await
    }

    /// CPU run state (RUN / STOP / unknown).
    pub async fn plc_status(&self) -> GatewayResult<PlcRunState> {
        let response = self.exchange_control(&PLC_STATUS_TELEGRAM).await?;
        if response.len() < 45 {
            return Err(GatewayError::protocol("Short CPU state reply"));
        }
        Ok(match response[44] {
            CPU_STATUS_RUN => PlcRunState::Run,
            CPU_STATUS_STOP => PlcRunState::Stop,
            _ => PlcRunState::Unknown,
        })
    }

    /// Read one SZL list; returns the record payload bytes.
    async fn read_szl(&self, id: u16, index: u16) -> GatewayResult<Vec<u8>> {
        let mut telegram = SZL_FIRST_TELEGRAM.to_vec();
        telegram[29..31].copy_from_slice(&id.to_be_bytes());
        telegram[31..33].copy_from_slice(&index.to_be_bytes());

        let response = self.exchange_control(&telegram).await?;
        if response.len() < MIN_SZL_RESPONSE {
            return Err(GatewayError::protocol("Short SZL reply"));
        }
        // SZL header: record length and count ahead of the data.
        let record_len = u16::from_be_bytes([response[37], response[38]]) as usize;
        let record_count = u16::from_be_bytes([response[39], response[40]]) as usize;
        let data_len = (record_len * record_count).min(response.len() - 41);
        Ok(response[41..41 + data_len].to_vec())
    }

    /// CPU identification from SZL 0x001C: module/serial/AS name strings,
    /// trailing NULs stripped.
    pub async fn cpu_info(&self) -> GatewayResult<CpuInfo> {
        let data = self.read_szl(0x001C, 0x0000).await?;
        let mut info = CpuInfo::default();
        for record in data.chunks(34) {
            if record.len() < 34 {
                break;
            }
            let index = u16::from_be_bytes([record[0], record[1]]);
            let text = clean_string(&record[2..34]);
            match index {
                1 => info.as_name = text,
                2 => info.module_name = text,
                5 => info.serial_number = text,
                7 => info.module_type_name = text,
                _ => {}
            }
        }
        Ok(info)
    }

    /// Module order code from SZL 0x0011.
    pub async fn order_code(&self) -> GatewayResult<String> {
        let data = self.read_szl(0x0011, 0x0000).await?;
        if data.len() < 22 {
            return Err(GatewayError::protocol("Short order code record"));
        }
        Ok(clean_string(&data[2..22]))
    }

    async fn read_inner(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        let access = self.resolve(&request.address)?;

        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        if let Some(bit) = access.bit {
            let bytes = self.read_area(transport, &access, 1).await?;
            let byte = bytes.first().copied().unwrap_or(0);
            return Ok(vec![PlcValue::Bool(byte & (1 << bit) != 0)]);
        }

        let length = Self::request_length(&access, request.data_type, request.count);
        let bytes = self.read_area(transport, &access, length).await?;
        let (values, short_fall) = codec::decode(&bytes, request.data_type, request.count.max(1));
        if short_fall > 0 {
            self.supervisor
                .notify_error(&GatewayError::data("Decode underflow on S7 read"));
            self.supervisor.record(false, 0.0);
        }
        Ok(values)
    }

    async fn write_inner(&self, request: &WriteRequest) -> GatewayResult<()> {
        let access = self.resolve(&request.address)?;
        if access.area.is_read_only() {
            return Err(GatewayError::address(request.address.as_str(), "area is read-only"));
        }

        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        if let Some(bit) = access.bit {
            return self
                .write_bit(transport, &access, bit, request.value.as_bool())
                .await;
        }

        let data = codec::encode(&request.value, request.data_type)?;
        self.write_area(transport, &access, &data).await
    }
}

#[async_trait]
impl ProtocolDriver for S7Driver {
    async fn connect(&self) -> GatewayResult<()> {
        if !self.supervisor.begin_connect() {
            return Ok(());
        }
        let config = self.config().clone();

        let result = IsoTcpTransport::connect(
            &config.host,
            config.port,
            self.rack,
            self.slot,
            self.conn_type,
            Duration::from_millis(config.timeout_ms),
        )
        .await;

        match result {
            Ok(transport) => {
                *self.transport.lock().await = Some(transport);
                self.supervisor.mark_connected();
                info!(host = %config.host, rack = self.rack, slot = self.slot, "S7 connected");
                let weak: Weak<dyn ProtocolDriver> = self.self_ref.clone();
                Arc::clone(&self.supervisor).ensure_heartbeat(weak);
                Ok(())
            }
            Err(e) => {
                warn!(host = %config.host, error = %e, "S7 connect failed");
                self.supervisor.mark_error();
                self.supervisor.notify_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.supervisor.stop_heartbeat();
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await.ok();
        }
        self.supervisor.mark_disconnected();
        debug!("S7 disconnected");
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
        // Minimal probe: one merker byte.
        let request = ReadRequest::new("MB0", 1, DataType::UInt8);
        self.read_inner(&request).await.is_ok()
    }

    fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}

fn clean_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}
