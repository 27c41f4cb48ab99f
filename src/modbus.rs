//! Modbus TCP and RTU driver.
//!
//! TCP and RTU share the application layer (the PDU) and differ only in
//! framing: MBAP header + PDU over TCP, slave address + PDU + CRC16 over
//! serial. Function codes are dispatched from the request's data type:
//!
//! | Data type | Read | Write |
//! |-----------|------|-------|
//! | coil / bool | FC01 | FC05 (single) / FC15 (multi) |
//! | discrete_input | FC02 | — |
//! | holding_register / uint16 / int16 | FC03 | FC06 (single) / FC16 (multi) |
//! | input_register | FC04 | — |
//! | uint32 / int32 / float32 / float64 | FC03, combined high word first | FC16 |

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{ProtocolConfig, ProtocolKind};
use crate::driver::{with_timeout, ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::supervisor::ConnectionSupervisor;
use crate::value::{DataType, PlcValue};

// ============================================================================
// Protocol constants (from the Modbus specification)
// ============================================================================

/// MBAP header length: transaction id (2) + protocol id (2) + length (2)
/// + unit id (1). The length field counts unit id + PDU.
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size, inherited from the RS485 ADU limit:
/// 256 − address (1) − CRC (2) = 253 bytes.
pub const MAX_PDU_SIZE: usize = 253;

/// FC03/FC04 register count limit: (253 − 2) / 2.
pub const MAX_READ_REGISTERS: u16 = 125;
/// FC16 register count limit: (253 − 6) / 2.
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// FC01/FC02 coil count limit.
pub const MAX_READ_COILS: u16 = 2000;
/// FC15 coil count limit.
pub const MAX_WRITE_COILS: u16 = 1968;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// PDU
// ============================================================================

/// Stack-allocated Modbus PDU.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        ModbusPdu {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> GatewayResult<Self> {
        if bytes.len() > MAX_PDU_SIZE {
            return Err(GatewayError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                bytes.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..bytes.len()].copy_from_slice(bytes);
        pdu.len = bytes.len();
        Ok(pdu)
    }

    #[inline]
    fn push(&mut self, byte: u8) -> GatewayResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(GatewayError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    #[inline]
    fn push_u16(&mut self, value: u16) -> GatewayResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    fn extend(&mut self, bytes: &[u8]) -> GatewayResult<()> {
        if self.len + bytes.len() > MAX_PDU_SIZE {
            return Err(GatewayError::protocol("PDU would exceed max size"));
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().map(|fc| fc & 0x80 != 0).unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    // ------------------------------------------------------------------
    // Request builders
    // ------------------------------------------------------------------

    /// Build a read request PDU for FC01–FC04.
    pub fn build_read(fc: u8, address: u16, quantity: u16) -> GatewayResult<ModbusPdu> {
        if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&fc) {
            return Err(GatewayError::protocol(format!("Invalid read FC {:#04x}", fc)));
        }
        let mut pdu = ModbusPdu::new();
        pdu.push(fc)?;
        pdu.push_u16(address)?;
        pdu.push_u16(quantity)?;
        Ok(pdu)
    }

    /// FC05: write single coil (0xFF00 on, 0x0000 off).
    pub fn build_write_single_coil(address: u16, value: bool) -> GatewayResult<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_SINGLE_COIL)?;
        pdu.push_u16(address)?;
        pdu.push_u16(if value { 0xFF00 } else { 0x0000 })?;
        Ok(pdu)
    }

    /// FC06: write single register.
    pub fn build_write_single_register(address: u16, value: u16) -> GatewayResult<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_SINGLE_REGISTER)?;
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    /// FC15: write multiple coils, bit-packed LSB first.
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> GatewayResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
            return Err(GatewayError::data("Invalid coil count for FC15"));
        }
        let packed = codec::pack_coils(values);
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_MULTIPLE_COILS)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push(packed.len() as u8)?;
        pdu.extend(&packed)?;
        Ok(pdu)
    }

    /// FC16: write multiple registers, big-endian.
    pub fn build_write_multiple_registers(
        address: u16,
        values: &[u16],
    ) -> GatewayResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(GatewayError::data("Invalid register count for FC16"));
        }
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_MULTIPLE_REGISTERS)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push((values.len() * 2) as u8)?;
        for &value in values {
            pdu.push_u16(value)?;
        }
        Ok(pdu)
    }

    // ------------------------------------------------------------------
    // Response parsers
    // ------------------------------------------------------------------

    /// Parse an FC01/FC02 response into `count` bit values.
    pub fn parse_bits(&self, count: usize) -> GatewayResult<Vec<bool>> {
        let data = self.as_slice();
        if data.len() < 2 {
            return Err(GatewayError::protocol("Short bit-read response"));
        }
        let byte_count = data[1] as usize;
        let payload = &data[2..(2 + byte_count).min(data.len())];
        Ok(codec::unpack_coils(payload, count))
    }

    /// Parse an FC03/FC04 response into register values.
    pub fn parse_registers(&self) -> GatewayResult<Vec<u16>> {
        let data = self.as_slice();
        if data.len() < 2 {
            return Err(GatewayError::protocol("Short register-read response"));
        }
        let byte_count = (data[1] as usize).min(data.len() - 2);
        let mut registers = Vec::with_capacity(byte_count / 2);
        for chunk in data[2..2 + byte_count].chunks_exact(2) {
            registers.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        Ok(registers)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Raise a typed error for an exception response.
fn check_exception(pdu: &ModbusPdu) -> GatewayResult<()> {
    if pdu.is_exception() {
        let fc = pdu.function_code().unwrap_or(0) & 0x7F;
        let code = pdu.exception_code().unwrap_or(0);
        return Err(GatewayError::communication(format!("FC{:02X}", fc), code as u16));
    }
    Ok(())
}

// ============================================================================
// CRC-16/MODBUS (poly 0xA001, reflected) for RTU framing
// ============================================================================

const CRC16_MODBUS: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// CRC over slave address + PDU, transmitted low byte first.
pub fn rtu_crc(frame: &[u8]) -> u16 {
    CRC16_MODBUS.checksum(frame)
}

// ============================================================================
// Transports
// ============================================================================

/// Modbus TCP transport: MBAP header + PDU.
pub struct ModbusTcpTransport {
    stream: TcpStream,
    transaction_id: u16,
    timeout: Duration,
}

impl ModbusTcpTransport {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> GatewayResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatewayError::timeout("connect", timeout.as_millis() as u64))?
            .map_err(|e| GatewayError::connection(format!("TCP connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        Ok(ModbusTcpTransport {
            stream,
            transaction_id: 0,
            timeout,
        })
    }

    pub async fn request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.request_inner(unit_id, pdu))
            .await
            .map_err(|_| GatewayError::timeout("request", timeout.as_millis() as u64))?
    }

    async fn request_inner(&mut self, unit_id: u8, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;

        // MBAP: tid, protocol id 0, length = unit id + PDU, unit id.
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu.as_slice());
        self.stream.write_all(&frame).await?;

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            self.stream.read_exact(&mut header).await?;

            let rx_tid = u16::from_be_bytes([header[0], header[1]]);
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;

            if protocol != 0 {
                return Err(GatewayError::protocol(format!(
                    "Unexpected MBAP protocol id {}",
                    protocol
                )));
            }
            if length < 2 || length > MAX_PDU_SIZE + 1 {
                return Err(GatewayError::protocol(format!(
                    "Invalid MBAP length {}",
                    length
                )));
            }

            let mut body = vec![0u8; length - 1];
            self.stream.read_exact(&mut body).await?;

            // Stale responses from a previous (timed out) transaction are
            // drained and ignored.
            if rx_tid != tid {
                debug!(rx_tid, tid, "discarding stale Modbus response");
                continue;
            }
            return ModbusPdu::from_slice(&body);
        }
    }

    pub async fn close(&mut self) -> GatewayResult<()> {
        self.stream.shutdown().await.ok();
        Ok(())
    }
}

/// Modbus RTU transport: slave address + PDU + CRC16 over a serial line,
/// with the mandated 3.5-character inter-frame silence.
#[cfg(feature = "rtu")]
pub struct ModbusRtuTransport {
    port: tokio_serial::SerialStream,
    timeout: Duration,
    /// 3.5 character times at the configured baud rate.
    inter_frame_gap: Duration,
    last_io: std::time::Instant,
}

#[cfg(feature = "rtu")]
impl ModbusRtuTransport {
    pub fn open(device: &str, baud_rate: u32, timeout: Duration) -> GatewayResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(device, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|e| GatewayError::connection(format!("Serial open {}: {}", device, e)))?;

        // One character is 11 bits on the wire (start + 8 data + parity
        // position + stop); the spec floor is ~1.75ms above 19200 baud.
        let char_micros = 11_000_000u64 / baud_rate as u64;
        let gap = Duration::from_micros((char_micros * 7 / 2).max(1750));

        Ok(ModbusRtuTransport {
            port,
            timeout,
            inter_frame_gap: gap,
            last_io: std::time::Instant::now(),
        })
    }

    pub async fn request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.request_inner(unit_id, pdu))
            .await
            .map_err(|_| GatewayError::timeout("request", timeout.as_millis() as u64))?
    }

    async fn request_inner(&mut self, unit_id: u8, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let since_last = self.last_io.elapsed();
        if since_last < self.inter_frame_gap {
            tokio::time::sleep(self.inter_frame_gap - since_last).await;
        }

        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(unit_id);
        frame.extend_from_slice(pdu.as_slice());
        let crc = rtu_crc(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        self.port.write_all(&frame).await?;

        // Address + function code first, then the length is knowable.
        let mut head = [0u8; 2];
        self.port.read_exact(&mut head).await?;
        let fc = head[1];

        let mut body = if fc & 0x80 != 0 {
            // Exception: code + CRC.
            let mut rest = [0u8; 3];
            self.port.read_exact(&mut rest).await?;
            rest.to_vec()
        } else {
            match fc {
                FC_READ_COILS..=FC_READ_INPUT_REGISTERS => {
                    let mut count = [0u8; 1];
                    self.port.read_exact(&mut count).await?;
                    let mut rest = vec![0u8; count[0] as usize + 2];
                    self.port.read_exact(&mut rest).await?;
                    let mut body = vec![count[0]];
                    body.extend_from_slice(&rest);
                    body
                }
                FC_WRITE_SINGLE_COIL
                | FC_WRITE_SINGLE_REGISTER
                | FC_WRITE_MULTIPLE_COILS
                | FC_WRITE_MULTIPLE_REGISTERS => {
                    let mut rest = [0u8; 6];
                    self.port.read_exact(&mut rest).await?;
                    rest.to_vec()
                }
                other => {
                    return Err(GatewayError::protocol(format!(
                        "Unexpected RTU function code {:#04x}",
                        other
                    )))
                }
            }
        };
        self.last_io = std::time::Instant::now();

        // Validate CRC over address + PDU.
        let crc_rx = u16::from_le_bytes([body[body.len() - 2], body[body.len() - 1]]);
        body.truncate(body.len() - 2);
        let mut check = vec![head[0], head[1]];
        check.extend_from_slice(&body);
        if rtu_crc(&check) != crc_rx {
            return Err(GatewayError::protocol("RTU CRC mismatch"));
        }

        let mut pdu_bytes = vec![fc];
        pdu_bytes.extend_from_slice(&body);
        ModbusPdu::from_slice(&pdu_bytes)
    }
}

enum Transport {
    Tcp(ModbusTcpTransport),
    #[cfg(feature = "rtu")]
    Rtu(ModbusRtuTransport),
}

impl Transport {
    async fn request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        match self {
            Transport::Tcp(t) => t.request(unit_id, pdu).await,
            #[cfg(feature = "rtu")]
            Transport::Rtu(t) => t.request(unit_id, pdu).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Transport::Tcp(t) => {
                t.close().await.ok();
            }
            #[cfg(feature = "rtu")]
            Transport::Rtu(_) => {}
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Modbus driver for both TCP and RTU endpoints.
pub struct ModbusDriver {
    supervisor: Arc<ConnectionSupervisor>,
    transport: tokio::sync::Mutex<Option<Transport>>,
    self_ref: Weak<ModbusDriver>,
}

impl ModbusDriver {
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| ModbusDriver {
            supervisor: Arc::new(ConnectionSupervisor::new(config)),
            transport: tokio::sync::Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    fn config(&self) -> &ProtocolConfig {
        self.supervisor.config()
    }

    fn unit_id(&self) -> u8 {
        self.config().unit_id
    }

    fn parse_address(address: &str) -> GatewayResult<u16> {
        address
            .trim()
            .parse::<u16>()
            .map_err(|_| GatewayError::address(address, "Modbus addresses are numeric 0-65535"))
    }

    async fn execute(&self, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;
        let response = transport.request(self.unit_id(), pdu).await?;
        check_exception(&response)?;
        Ok(response)
    }

    async fn read_inner(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        let address = Self::parse_address(&request.address)?;
        let count = request.count.max(1);

        match request.data_type {
            DataType::Coil | DataType::Bool => {
                if count > MAX_READ_COILS as usize {
                    return Err(GatewayError::data("Coil count exceeds FC01 limit"));
                }
                let pdu = ModbusPdu::build_read(FC_READ_COILS, address, count as u16)?;
                let response = self.execute(&pdu).await?;
                let bits = response.parse_bits(count)?;
                Ok(bits.into_iter().map(PlcValue::Bool).collect())
            }
            DataType::DiscreteInput => {
                let pdu = ModbusPdu::build_read(FC_READ_DISCRETE_INPUTS, address, count as u16)?;
                let response = self.execute(&pdu).await?;
                let bits = response.parse_bits(count)?;
                Ok(bits.into_iter().map(PlcValue::Bool).collect())
            }
            DataType::InputRegister => {
                let pdu = ModbusPdu::build_read(FC_READ_INPUT_REGISTERS, address, count as u16)?;
                let response = self.execute(&pdu).await?;
                let regs = response.parse_registers()?;
                Ok(regs
                    .into_iter()
                    .map(|r| PlcValue::UInt(r as u64))
                    .collect())
            }
            DataType::Str => Err(GatewayError::data("Modbus has no string data model")),
            other => {
                // Register-backed numeric types via FC03.
                let per_element = other.register_count().max(1);
                let quantity = (count * per_element) as u16;
                if quantity > MAX_READ_REGISTERS {
                    return Err(GatewayError::data("Register count exceeds FC03 limit"));
                }
                let pdu = ModbusPdu::build_read(FC_READ_HOLDING_REGISTERS, address, quantity)?;
                let response = self.execute(&pdu).await?;
                let regs = response.parse_registers()?;
                if regs.len() < count * per_element {
                    self.supervisor
                        .notify_error(&GatewayError::data("Short Modbus register response"));
                }
                let mut values = Vec::with_capacity(count);
                for i in 0..count {
                    let chunk = &regs[(i * per_element).min(regs.len())
                        ..((i + 1) * per_element).min(regs.len())];
                    if chunk.len() < per_element {
                        values.push(PlcValue::zero_for(other));
                    } else {
                        values.push(codec::registers_to_value(chunk, other)?);
                    }
                }
                Ok(values)
            }
        }
    }

    async fn write_inner(&self, request: &WriteRequest) -> GatewayResult<()> {
        let address = Self::parse_address(&request.address)?;

        if request.data_type.is_read_only_table() {
            return Err(GatewayError::address(
                request.address.as_str(),
                format!("{} is a read-only table", request.data_type),
            ));
        }

        match request.data_type {
            DataType::Coil | DataType::Bool => {
                let pdu = ModbusPdu::build_write_single_coil(address, request.value.as_bool())?;
                self.execute(&pdu).await?;
                Ok(())
            }
            DataType::Str => Err(GatewayError::data("Modbus has no string data model")),
            other => {
                let regs = codec::value_to_registers(&request.value, other)?;
                let pdu = if regs.len() == 1 {
                    ModbusPdu::build_write_single_register(address, regs[0])?
                } else {
                    ModbusPdu::build_write_multiple_registers(address, &regs)?
                };
                self.execute(&pdu).await?;
                Ok(())
            }
        }
    }

    /// Write a run of coils with FC15, through the driver gate.
    pub async fn write_coils(&self, address: u16, values: &[bool]) -> GatewayResult<()> {
        let started = std::time::Instant::now();
        let pdu = ModbusPdu::build_write_multiple_coils(address, values)?;
        let result = self.execute(&pdu).await.map(|_| ());
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }

    /// Write a run of registers with FC16, through the driver gate.
    pub async fn write_registers(&self, address: u16, values: &[u16]) -> GatewayResult<()> {
        let started = std::time::Instant::now();
        let pdu = ModbusPdu::build_write_multiple_registers(address, values)?;
        let result = self.execute(&pdu).await.map(|_| ());
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.supervisor.record(true, elapsed),
            Err(e) => self.supervisor.record_failure(e, elapsed),
        }
        result
    }
}

#[async_trait]
impl ProtocolDriver for ModbusDriver {
    async fn connect(&self) -> GatewayResult<()> {
        if !self.supervisor.begin_connect() {
            return Ok(());
        }
        let config = self.config().clone();
        let timeout = Duration::from_millis(config.timeout_ms);

        let result = match config.protocol_kind {
            ProtocolKind::ModbusRtu => {
                #[cfg(feature = "rtu")]
                {
                    ModbusRtuTransport::open(&config.serial_device, config.baud_rate, timeout)
                        .map(Transport::Rtu)
                }
                #[cfg(not(feature = "rtu"))]
                {
                    Err(GatewayError::configuration(
                        "Modbus RTU support requires the 'rtu' feature",
                    ))
                }
            }
            _ => ModbusTcpTransport::connect(&config.host, config.port, timeout)
                .await
                .map(Transport::Tcp),
        };

        match result {
            Ok(transport) => {
                *self.transport.lock().await = Some(transport);
                self.supervisor.mark_connected();
                info!(host = %config.host, unit = config.unit_id, "Modbus connected");
                let weak: Weak<dyn ProtocolDriver> = self.self_ref.clone();
                Arc::clone(&self.supervisor).ensure_heartbeat(weak);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Modbus connect failed");
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
        debug!("Modbus disconnected");
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
        // FC3 of one register is the minimal liveness probe.
        let request = ReadRequest::new("0", 1, DataType::HoldingRegister);
        self.read_inner(&request).await.is_ok()
    }

    fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}

// ============================================================================
// Tests
// ============================================================================
