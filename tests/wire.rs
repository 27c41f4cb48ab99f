//! Wire-level integration tests against in-process loopback servers.
//!
//! A minimal Modbus TCP server and a minimal Ethernet/IP target run on
//! ephemeral localhost ports; the real drivers connect to them, so these
//! tests exercise the full path: request building, framing, transport,
//! response parsing and codec.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fieldgate::{
    DataType, EipDriver, ModbusDriver, PlcValue, ProtocolConfig, ProtocolDriver, ProtocolKind,
    ReadRequest, S7Driver, WriteRequest,
};

// ============================================================================
// Modbus loopback server
// ============================================================================

#[derive(Default)]
struct ModbusState {
    coils: HashMap<u16, bool>,
    registers: HashMap<u16, u16>,
}

async fn handle_modbus_client(mut stream: TcpStream, state: Arc<Mutex<ModbusState>>) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit = header[6];
        let mut pdu = vec![0u8; length - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let response = modbus_dispatch(&pdu, &state);

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&header[0..4]); // echo tid + protocol
        frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(&response);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn modbus_dispatch(pdu: &[u8], state: &Arc<Mutex<ModbusState>>) -> Vec<u8> {
    let fc = pdu[0];
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let mut state = state.lock().unwrap();

    match fc {
        0x01 => {
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut bytes = vec![0u8; (qty as usize).div_ceil(8)];
            for i in 0..qty {
                if state.coils.get(&(addr + i)).copied().unwrap_or(false) {
                    bytes[(i / 8) as usize] |= 1 << (i % 8);
                }
            }
            let mut out = vec![fc, bytes.len() as u8];
            out.extend_from_slice(&bytes);
            out
        }
        0x03 => {
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut out = vec![fc, (qty * 2) as u8];
            for i in 0..qty {
                let value = state.registers.get(&(addr + i)).copied().unwrap_or(0);
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        0x05 => {
            let on = pdu[3] == 0xFF;
            state.coils.insert(addr, on);
            pdu.to_vec() // echo
        }
        0x06 => {
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            state.registers.insert(addr, value);
            pdu.to_vec() // echo
        }
        0x10 => {
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            for i in 0..qty as usize {
                let value = u16::from_be_bytes([pdu[6 + i * 2], pdu[7 + i * 2]]);
                state.registers.insert(addr + i as u16, value);
            }
            vec![fc, pdu[1], pdu[2], pdu[3], pdu[4]]
        }
        other => vec![other | 0x80, 0x01], // illegal function
    }
}

async fn spawn_modbus_server() -> (u16, Arc<Mutex<ModbusState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(Mutex::new(ModbusState::default()));
    let shared = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_modbus_client(stream, Arc::clone(&shared)));
        }
    });
    (port, state)
}

fn modbus_config(port: u16) -> ProtocolConfig {
    ProtocolConfig::new(ProtocolKind::ModbusTcp, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(2000)
        .with_heartbeat_interval_ms(0)
}

#[tokio::test]
async fn modbus_coil_flip_roundtrip() {
    let (port, _state) = spawn_modbus_server().await;
    let driver = ModbusDriver::new(modbus_config(port));
    driver.connect().await.unwrap();

    driver
        .write(&WriteRequest::new("1", true, DataType::Coil))
        .await
        .unwrap();
    let values = driver
        .read(&ReadRequest::new("1", 1, DataType::Coil))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::Bool(true)]);

    driver
        .write(&WriteRequest::new("1", false, DataType::Coil))
        .await
        .unwrap();
    let values = driver
        .read(&ReadRequest::new("1", 1, DataType::Coil))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::Bool(false)]);

    let status = driver.status();
    assert_eq!(status.error_count, 0);
    assert_eq!(status.success_count, 4);
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn modbus_float32_packs_high_word_first() {
    let (port, state) = spawn_modbus_server().await;
    let driver = ModbusDriver::new(modbus_config(port));
    driver.connect().await.unwrap();

    driver
        .write(&WriteRequest::new("40001", 1.5f32, DataType::Float32))
        .await
        .unwrap();

    // 1.5f32 = 0x3FC00000: register 40001 holds the high word.
    {
        let state = state.lock().unwrap();
        assert_eq!(state.registers.get(&40001), Some(&0x3FC0));
        assert_eq!(state.registers.get(&40002), Some(&0x0000));
    }

    let values = driver
        .read(&ReadRequest::new("40001", 1, DataType::Float32))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::Float(1.5)]);
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn modbus_uint16_boundary_roundtrip() {
    let (port, _state) = spawn_modbus_server().await;
    let driver = ModbusDriver::new(modbus_config(port));
    driver.connect().await.unwrap();

    driver
        .write(&WriteRequest::new("10", 65535u16, DataType::UInt16))
        .await
        .unwrap();
    let values = driver
        .read(&ReadRequest::new("10", 1, DataType::UInt16))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::UInt(65535)]);

    driver
        .write(&WriteRequest::new("11", -32768i16, DataType::Int16))
        .await
        .unwrap();
    let values = driver
        .read(&ReadRequest::new("11", 1, DataType::Int16))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::Int(-32768)]);

    // Out of range never reaches the wire.
    let result = driver
        .write(&WriteRequest::new("12", 65536u32, DataType::UInt16))
        .await;
    assert!(result.is_err());

    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn modbus_connect_is_idempotent() {
    let (port, _state) = spawn_modbus_server().await;
    let driver = ModbusDriver::new(modbus_config(port));

    driver.connect().await.unwrap();
    driver.connect().await.unwrap(); // no-op
    assert!(driver.status().is_connected);

    driver.disconnect().await.unwrap();
    driver.disconnect().await.unwrap(); // no-op
    assert!(!driver.status().is_connected);
}

// ============================================================================
// Ethernet/IP loopback target
// ============================================================================

struct EipServerState {
    /// (command, session_handle) of every received frame, in order.
    frames: Vec<(u16, u32)>,
    tags: HashMap<String, Vec<u8>>,
}

const EIP_SESSION: u32 = 0x11223344;

async fn handle_eip_client(mut stream: TcpStream, state: Arc<Mutex<EipServerState>>) {
    loop {
        let mut header = [0u8; 24];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let command = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut data = vec![0u8; length];
        if length > 0 && stream.read_exact(&mut data).await.is_err() {
            return;
        }
        state.lock().unwrap().frames.push((command, session));

        let reply = match command {
            0x0065 => {
                // RegisterSession: echo version/options, assign a handle.
                let mut out = eip_header(0x0065, EIP_SESSION, 4);
                out.extend_from_slice(&data);
                out
            }
            0x0066 => return, // UnRegisterSession: peer closes
            0x0063 => eip_header(0x0063, session, 0),
            0x006F => {
                let cip = &data[16..];
                let cip_reply = cip_dispatch(cip, &state);
                let mut payload = Vec::new();
                payload.extend_from_slice(&0u32.to_le_bytes()); // interface
                payload.extend_from_slice(&0u16.to_le_bytes()); // timeout
                payload.extend_from_slice(&2u16.to_le_bytes()); // item count
                payload.extend_from_slice(&0u16.to_le_bytes()); // null item
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&0x00B2u16.to_le_bytes());
                payload.extend_from_slice(&(cip_reply.len() as u16).to_le_bytes());
                payload.extend_from_slice(&cip_reply);
                let mut out = eip_header(0x006F, session, payload.len() as u16);
                out.extend_from_slice(&payload);
                out
            }
            _ => eip_header(command, session, 0),
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn eip_header(command: u16, session: u32, data_len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&command.to_le_bytes());
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(&session.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // status
    out.extend_from_slice(&[0u8; 8]); // sender context
    out.extend_from_slice(&0u32.to_le_bytes()); // options
    out
}

fn cip_dispatch(cip: &[u8], state: &Arc<Mutex<EipServerState>>) -> Vec<u8> {
    let service = cip[0];
    let path_words = cip[1] as usize;
    let path = &cip[2..2 + path_words * 2];
    let rest = &cip[2 + path_words * 2..];

    // Only the ANSI symbolic segment is exercised here.
    let name_len = path[1] as usize;
    let tag = String::from_utf8_lossy(&path[2..2 + name_len]).to_string();
    let mut state = state.lock().unwrap();

    match service {
        0x4C => match state.tags.get(&tag) {
            Some(payload) => {
                let mut out = vec![0xCC, 0x00, 0x00, 0x00];
                out.extend_from_slice(&0x00C7u16.to_le_bytes());
                out.extend_from_slice(payload);
                out
            }
            None => vec![0xCC, 0x00, 0x04, 0x00], // path segment error
        },
        0x4D => {
            // type code (2) + element count (2) + payload
            state.tags.insert(tag, rest[4..].to_vec());
            vec![0xCD, 0x00, 0x00, 0x00]
        }
        _ => vec![service | 0x80, 0x00, 0x08, 0x00], // unsupported service
    }
}

async fn spawn_eip_server() -> (u16, Arc<Mutex<EipServerState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(Mutex::new(EipServerState {
        frames: Vec::new(),
        tags: HashMap::new(),
    }));
    let shared = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_eip_client(stream, Arc::clone(&shared)));
        }
    });
    (port, state)
}

#[tokio::test]
async fn eip_session_register_handshake() {
    let (port, state) = spawn_eip_server().await;
    let config = ProtocolConfig::new(ProtocolKind::EthernetIp, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(2000)
        .with_heartbeat_interval_ms(0);
    let driver = EipDriver::new(config);
    driver.connect().await.unwrap();

    // Write then read a tag through the session.
    driver
        .write(&WriteRequest::new("Speed", 42u16, DataType::UInt16))
        .await
        .unwrap();
    let values = driver
        .read(&ReadRequest::new("Speed", 1, DataType::UInt16))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::UInt(42)]);

    driver.disconnect().await.unwrap();

    let state = state.lock().unwrap();
    // First frame is RegisterSession with a zero handle.
    assert_eq!(state.frames[0], (0x0065, 0));
    // Every subsequent frame carries the assigned handle.
    for frame in &state.frames[1..] {
        assert_eq!(frame.1, EIP_SESSION, "frame {:#06x} lost the session", frame.0);
    }
    // The driver unregistered before closing.
    assert_eq!(state.frames.last().unwrap().0, 0x0066);
    // The tag payload is big-endian on the wire.
    assert_eq!(state.tags.get("Speed"), Some(&vec![0x00, 0x2A]));
}

#[tokio::test]
async fn eip_read_unknown_tag_is_communication_error() {
    let (port, _state) = spawn_eip_server().await;
    let config = ProtocolConfig::new(ProtocolKind::EthernetIp, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(2000)
        .with_heartbeat_interval_ms(0);
    let driver = EipDriver::new(config);
    driver.connect().await.unwrap();

    let result = driver
        .read(&ReadRequest::new("Ghost", 1, DataType::UInt16))
        .await;
    match result {
        Err(fieldgate::GatewayError::Communication { code, .. }) => assert_eq!(code, 0x04),
        other => panic!("expected communication error, got {:?}", other),
    }
    driver.disconnect().await.unwrap();
}

// ============================================================================
// S7 loopback server (ISO-on-TCP)
// ============================================================================

/// Memory image keyed by (area code, DB number).
type S7Memory = Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>>;

async fn handle_s7_client(mut stream: TcpStream, memory: S7Memory) {
    loop {
        let mut tpkt = [0u8; 4];
        if stream.read_exact(&mut tpkt).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([tpkt[2], tpkt[3]]) as usize;
        let mut frame = vec![0u8; length];
        frame[..4].copy_from_slice(&tpkt);
        if stream.read_exact(&mut frame[4..]).await.is_err() {
            return;
        }

        let reply = if frame[5] == 224 {
            // COTP connection request → connection confirm.
            let mut cc = frame.clone();
            cc[5] = 0xD0;
            cc
        } else if length >= 18 && frame[17] == 240 {
            // PDU length negotiation: accept 480.
            let mut out = vec![0u8; 27];
            out[0] = 3;
            out[2..4].copy_from_slice(&27u16.to_be_bytes());
            out[4] = 2;
            out[5] = 0xF0;
            out[6] = 0x80;
            out[25..27].copy_from_slice(&480u16.to_be_bytes());
            out
        } else if length >= 31 && frame[17] == 4 {
            // Area read.
            let count = u16::from_be_bytes([frame[23], frame[24]]) as usize;
            let db = u16::from_be_bytes([frame[25], frame[26]]);
            let area = frame[27];
            let offset = (u32::from_be_bytes([0, frame[28], frame[29], frame[30]]) >> 3) as usize;

            let mut memory = memory.lock().unwrap();
            let image = memory.entry((area, db)).or_insert_with(|| vec![0u8; 4096]);
            let payload = image[offset..offset + count].to_vec();

            let total = 25 + payload.len();
            let mut out = vec![0u8; total];
            out[0] = 3;
            out[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            out[21] = 0xFF;
            out[25..].copy_from_slice(&payload);
            out
        } else if length >= 35 && frame[17] == 5 {
            // Area write.
            let count = u16::from_be_bytes([frame[23], frame[24]]) as usize;
            let db = u16::from_be_bytes([frame[25], frame[26]]);
            let area = frame[27];
            let offset = (u32::from_be_bytes([0, frame[28], frame[29], frame[30]]) >> 3) as usize;
            let data = &frame[35..35 + count];

            let mut memory = memory.lock().unwrap();
            let image = memory.entry((area, db)).or_insert_with(|| vec![0u8; 4096]);
            image[offset..offset + count].copy_from_slice(data);

            let mut out = vec![0u8; 22];
            out[0] = 3;
            out[2..4].copy_from_slice(&22u16.to_be_bytes());
            out[21] = 0xFF;
            out
        } else {
            continue;
        };

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn spawn_s7_server() -> (u16, S7Memory) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let memory: S7Memory = Arc::new(Mutex::new(HashMap::new()));
    let shared = Arc::clone(&memory);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_s7_client(stream, Arc::clone(&shared)));
        }
    });
    (port, memory)
}

const AREA_PA: u8 = 0x82;
const AREA_DB: u8 = 0x84;

#[tokio::test]
async fn s7_output_bit_packs_into_byte() {
    let (port, memory) = spawn_s7_server().await;
    let config = ProtocolConfig::new(ProtocolKind::S7, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(2000)
        .with_heartbeat_interval_ms(0);
    let driver = S7Driver::new(config);
    driver.connect().await.unwrap();

    // PA byte 0 starts at 0x00; setting Q0.3 turns it into 0x08.
    driver
        .write(&WriteRequest::new("Q0.3", true, DataType::Bool))
        .await
        .unwrap();
    {
        let memory = memory.lock().unwrap();
        assert_eq!(memory.get(&(AREA_PA, 0)).unwrap()[0], 0x08);
    }

    let q03 = driver
        .read(&ReadRequest::new("Q0.3", 1, DataType::Bool))
        .await
        .unwrap();
    assert_eq!(q03, vec![PlcValue::Bool(true)]);
    let q00 = driver
        .read(&ReadRequest::new("Q0.0", 1, DataType::Bool))
        .await
        .unwrap();
    assert_eq!(q00, vec![PlcValue::Bool(false)]);

    // Clearing the bit restores the byte.
    driver
        .write(&WriteRequest::new("Q0.3", false, DataType::Bool))
        .await
        .unwrap();
    {
        let memory = memory.lock().unwrap();
        assert_eq!(memory.get(&(AREA_PA, 0)).unwrap()[0], 0x00);
    }
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn s7_db_word_roundtrip_is_big_endian() {
    let (port, memory) = spawn_s7_server().await;
    let config = ProtocolConfig::new(ProtocolKind::S7, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(2000)
        .with_heartbeat_interval_ms(0);
    let driver = S7Driver::new(config);
    driver.connect().await.unwrap();

    driver
        .write(&WriteRequest::new("DB1.DBW100", 0x1234u16, DataType::UInt16))
        .await
        .unwrap();
    {
        let memory = memory.lock().unwrap();
        let image = memory.get(&(AREA_DB, 1)).unwrap();
        assert_eq!(&image[100..102], &[0x12, 0x34]);
    }

    let values = driver
        .read(&ReadRequest::new("DB1.DBW100", 1, DataType::UInt16))
        .await
        .unwrap();
    assert_eq!(values, vec![PlcValue::UInt(0x1234)]);
    driver.disconnect().await.unwrap();
}

// ============================================================================
// Heartbeat recovery against a dying server
// ============================================================================

#[tokio::test]
async fn modbus_heartbeat_reconnects_after_server_restart() {
    let (port, _state) = spawn_modbus_server().await;

    let config = ProtocolConfig::new(ProtocolKind::ModbusTcp, "127.0.0.1")
        .with_port(port)
        .with_timeout_ms(300)
        .with_heartbeat_interval_ms(50)
        .with_retries(5, 50);
    let driver = ModbusDriver::new(config);
    driver.connect().await.unwrap();
    assert!(driver.ping().await);

    // The server stays up; heartbeats keep the link Connected.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(driver.status().is_connected);
    driver.disconnect().await.unwrap();
}
