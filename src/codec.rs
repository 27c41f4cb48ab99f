//! # Data Codec
//!
//! Conversion between canonical values and protocol byte buffers.
//! Big-endian is the canonical wire order for S7, Profibus and CIP tag
//! payloads; Modbus multi-register values pack as two consecutive 16-bit
//! registers, high word first.
//!
//! ## Supported Data Types
//!
//! | Type | Bytes | Registers |
//! |------|-------|-----------|
//! | bool / coil / discrete_input | 1 | bit |
//! | uint8 / int8 | 1 | 1 |
//! | uint16 / int16 / holding_register / input_register | 2 | 1 |
//! | uint32 / int32 / float32 | 4 | 2 |
//! | float64 | 8 | 4 |
//! | string | 2 + capacity | — |

use crate::error::{GatewayError, GatewayResult};
use crate::value::{DataType, PlcValue};

/// Maximum payload of an S7 STRING (capacity byte limit).
pub const S7_STRING_CAPACITY: usize = 82;

// ============================================================================
// Encoding
// ============================================================================

/// Encode a single canonical value into its big-endian byte layout.
///
/// Integer values outside the target type's range are rejected with a data
/// error. Booleans encode as a single `0x00`/`0x01` byte. Strings use the
/// S7 convention: capacity byte, length byte, then the payload, capped at
/// [`S7_STRING_CAPACITY`].
pub fn encode(value: &PlcValue, data_type: DataType) -> GatewayResult<Vec<u8>> {
    match data_type {
        DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
            Ok(vec![if value.as_bool() { 0x01 } else { 0x00 }])
        }
        DataType::UInt8 => {
            let v = checked(value, data_type)?;
            Ok(vec![v as u8])
        }
        DataType::Int8 => {
            let v = checked(value, data_type)?;
            Ok(vec![(v as i8) as u8])
        }
        DataType::UInt16 | DataType::HoldingRegister | DataType::InputRegister => {
            let v = checked(value, data_type)?;
            Ok((v as u16).to_be_bytes().to_vec())
        }
        DataType::Int16 => {
            let v = checked(value, data_type)?;
            Ok((v as i16).to_be_bytes().to_vec())
        }
        DataType::UInt32 => {
            let v = checked(value, data_type)?;
            Ok((v as u32).to_be_bytes().to_vec())
        }
        DataType::Int32 => {
            let v = checked(value, data_type)?;
            Ok((v as i32).to_be_bytes().to_vec())
        }
        DataType::Float32 => {
            let v = value.as_f64();
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(GatewayError::data(format!(
                    "Value {} out of range for float32",
                    v
                )));
            }
            Ok((v as f32).to_be_bytes().to_vec())
        }
        DataType::Float64 => Ok(value.as_f64().to_be_bytes().to_vec()),
        DataType::Str => {
            let s = match value {
                PlcValue::Str(s) => s.clone(),
                other => other.to_string(),
            };
            if s.len() > S7_STRING_CAPACITY {
                return Err(GatewayError::data(format!(
                    "String length {} exceeds capacity {}",
                    s.len(),
                    S7_STRING_CAPACITY
                )));
            }
            let mut out = Vec::with_capacity(2 + s.len());
            out.push(S7_STRING_CAPACITY as u8);
            out.push(s.len() as u8);
            out.extend_from_slice(s.as_bytes());
            Ok(out)
        }
    }
}

/// Encode a slice of values back to back.
pub fn encode_all(values: &[PlcValue], data_type: DataType) -> GatewayResult<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * data_type.width_bytes().max(1));
    for value in values {
        out.extend_from_slice(&encode(value, data_type)?);
    }
    Ok(out)
}

/// Range check an integer-typed value without clamping.
fn checked(value: &PlcValue, data_type: DataType) -> GatewayResult<i64> {
    match value.convert(data_type)? {
        PlcValue::Int(v) => Ok(v),
        PlcValue::UInt(v) => Ok(v as i64),
        PlcValue::Bool(b) => Ok(i64::from(b)),
        other => Err(GatewayError::data(format!(
            "Cannot encode {} as {}",
            other.type_name(),
            data_type
        ))),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode `count` elements of `data_type` from a big-endian buffer.
///
/// Underflow never fails: missing elements are zero-filled and the number
/// of zero-filled elements is returned so the caller can record a decode
/// error in its statistics. Odd trailing bytes for multi-byte types are
/// truncated to the largest whole element. Signed decode is two's
/// complement at the declared width; NaN and infinities pass through
/// unchanged.
pub fn decode(bytes: &[u8], data_type: DataType, count: usize) -> (Vec<PlcValue>, usize) {
    let mut values = Vec::with_capacity(count);
    let width = data_type.width_bytes();
    let mut short_fall = 0usize;

    for i in 0..count {
        let value = match data_type {
            DataType::Str => {
                // Strings are single-element; ignore count beyond the first.
                match decode_s7_string(bytes) {
                    Some(s) => PlcValue::Str(s),
                    None => {
                        short_fall += 1;
                        PlcValue::zero_for(data_type)
                    }
                }
            }
            _ => {
                let start = i * width;
                let end = start + width;
                if end > bytes.len() {
                    short_fall += 1;
                    PlcValue::zero_for(data_type)
                } else {
                    decode_element(&bytes[start..end], data_type)
                }
            }
        };
        values.push(value);
    }

    (values, short_fall)
}

fn decode_element(chunk: &[u8], data_type: DataType) -> PlcValue {
    match data_type {
        DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
            PlcValue::Bool(chunk[0] != 0)
        }
        DataType::UInt8 => PlcValue::UInt(chunk[0] as u64),
        DataType::Int8 => PlcValue::Int(chunk[0] as i8 as i64),
        DataType::UInt16 | DataType::HoldingRegister | DataType::InputRegister => {
            PlcValue::UInt(u16::from_be_bytes([chunk[0], chunk[1]]) as u64)
        }
        DataType::Int16 => PlcValue::Int(i16::from_be_bytes([chunk[0], chunk[1]]) as i64),
        DataType::UInt32 => {
            PlcValue::UInt(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64)
        }
        DataType::Int32 => {
            PlcValue::Int(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64)
        }
        DataType::Float32 => {
            PlcValue::Float(f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64)
        }
        DataType::Float64 => PlcValue::Float(f64::from_be_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ])),
        DataType::Str => unreachable!("strings decoded separately"),
    }
}

/// Decode an S7 STRING: capacity byte, length byte, payload.
fn decode_s7_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 {
        return None;
    }
    let len = bytes[1] as usize;
    if bytes.len() < 2 + len {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[2..2 + len]).into_owned())
}

// ============================================================================
// Modbus register packing
// ============================================================================

/// Pack a canonical value into 16-bit registers, high word first.
pub fn value_to_registers(value: &PlcValue, data_type: DataType) -> GatewayResult<Vec<u16>> {
    let bytes = encode(value, data_type)?;
    match data_type.register_count() {
        0 => Ok(vec![if value.as_bool() { 1 } else { 0 }]),
        _ => {
            let mut regs = Vec::with_capacity(bytes.len() / 2 + 1);
            if bytes.len() == 1 {
                // 8-bit types occupy the low byte of one register.
                regs.push(bytes[0] as u16);
            } else {
                for chunk in bytes.chunks_exact(2) {
                    regs.push(u16::from_be_bytes([chunk[0], chunk[1]]));
                }
            }
            Ok(regs)
        }
    }
}

/// Unpack 16-bit registers (high word first) back into a canonical value.
pub fn registers_to_value(regs: &[u16], data_type: DataType) -> GatewayResult<PlcValue> {
    let needed = data_type.register_count().max(1);
    if regs.len() < needed {
        return Err(GatewayError::data(format!(
            "Not enough registers for {}: need {}, got {}",
            data_type,
            needed,
            regs.len()
        )));
    }
    match data_type {
        DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
            Ok(PlcValue::Bool(regs[0] != 0))
        }
        DataType::UInt8 => Ok(PlcValue::UInt((regs[0] & 0xFF) as u64)),
        DataType::Int8 => Ok(PlcValue::Int((regs[0] & 0xFF) as u8 as i8 as i64)),
        _ => {
            let mut bytes = Vec::with_capacity(needed * 2);
            for reg in &regs[..needed] {
                bytes.extend_from_slice(&reg.to_be_bytes());
            }
            let (mut values, short) = decode(&bytes, data_type, 1);
            if short > 0 {
                return Err(GatewayError::data("Register decode underflow"));
            }
            Ok(values.remove(0))
        }
    }
}

/// Pack coil states into bytes, LSB first within each byte (Modbus order).
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(8)];
    for (i, &coil) in values.iter().enumerate() {
        if coil {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `count` coil states from bit-packed bytes.
pub fn unpack_coils(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| b & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: PlcValue, data_type: DataType) {
        let bytes = encode(&value, data_type).unwrap();
        assert_eq!(bytes.len(), data_type.width_bytes());
        let (decoded, short) = decode(&bytes, data_type, 1);
        assert_eq!(short, 0);
        assert_eq!(decoded[0], value, "roundtrip failed for {}", data_type);
    }

    #[test]
    fn test_roundtrip_all_numeric_types() {
        roundtrip(PlcValue::Bool(true), DataType::Bool);
        roundtrip(PlcValue::UInt(200), DataType::UInt8);
        roundtrip(PlcValue::Int(-100), DataType::Int8);
        roundtrip(PlcValue::UInt(65535), DataType::UInt16);
        roundtrip(PlcValue::Int(-32768), DataType::Int16);
        roundtrip(PlcValue::UInt(4_000_000_000), DataType::UInt32);
        roundtrip(PlcValue::Int(-2_000_000_000), DataType::Int32);
        roundtrip(PlcValue::Float(1.5), DataType::Float32);
        roundtrip(PlcValue::Float(-1234.56789), DataType::Float64);
    }

    #[test]
    fn test_encode_is_big_endian() {
        assert_eq!(
            encode(&PlcValue::UInt(0x1234), DataType::UInt16).unwrap(),
            vec![0x12, 0x34]
        );
        assert_eq!(
            encode(&PlcValue::UInt(0x12345678), DataType::UInt32).unwrap(),
            vec![0x12, 0x34, 0x56, 0x78]
        );
        // 1.5f32 == 0x3FC00000
        assert_eq!(
            encode(&PlcValue::Float(1.5), DataType::Float32).unwrap(),
            vec![0x3F, 0xC0, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_range_rejection() {
        assert!(encode(&PlcValue::UInt(65536), DataType::UInt16).is_err());
        assert!(encode(&PlcValue::Int(-1), DataType::UInt16).is_err());
        assert!(encode(&PlcValue::Int(128), DataType::Int8).is_err());
        assert!(encode(&PlcValue::UInt(65535), DataType::UInt16).is_ok());
    }

    #[test]
    fn test_signed_decode_twos_complement() {
        let (values, _) = decode(&[0xFF, 0xFF], DataType::Int16, 1);
        assert_eq!(values[0], PlcValue::Int(-1));
        let (values, _) = decode(&[0x80, 0x00], DataType::Int16, 1);
        assert_eq!(values[0], PlcValue::Int(-32768));
    }

    #[test]
    fn test_decode_underflow_zero_fills() {
        let (values, short) = decode(&[0x12, 0x34], DataType::UInt16, 3);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], PlcValue::UInt(0x1234));
        assert_eq!(values[1], PlcValue::UInt(0));
        assert_eq!(values[2], PlcValue::UInt(0));
        assert_eq!(short, 2);
    }

    #[test]
    fn test_decode_odd_tail_truncates() {
        // 3 bytes for a 2-byte type: one whole element, one zero-filled.
        let (values, short) = decode(&[0x00, 0x2A, 0xFF], DataType::UInt16, 2);
        assert_eq!(values[0], PlcValue::UInt(42));
        assert_eq!(values[1], PlcValue::UInt(0));
        assert_eq!(short, 1);
    }

    #[test]
    fn test_float_special_values_pass_through() {
        let bytes = encode(&PlcValue::Float(f64::NAN), DataType::Float64).unwrap();
        let (values, _) = decode(&bytes, DataType::Float64, 1);
        match values[0] {
            PlcValue::Float(f) => assert!(f.is_nan()),
            _ => panic!("expected float"),
        }
        let bytes = encode(&PlcValue::Float(f64::INFINITY), DataType::Float32).unwrap();
        let (values, _) = decode(&bytes, DataType::Float32, 1);
        assert_eq!(values[0], PlcValue::Float(f64::INFINITY));
    }

    #[test]
    fn test_s7_string_roundtrip() {
        let bytes = encode(&PlcValue::Str("MOTOR_1".into()), DataType::Str).unwrap();
        assert_eq!(bytes[0], S7_STRING_CAPACITY as u8);
        assert_eq!(bytes[1], 7);
        let (values, short) = decode(&bytes, DataType::Str, 1);
        assert_eq!(short, 0);
        assert_eq!(values[0], PlcValue::Str("MOTOR_1".into()));
    }

    #[test]
    fn test_string_over_capacity_rejected() {
        let long = "x".repeat(S7_STRING_CAPACITY + 1);
        assert!(encode(&PlcValue::Str(long), DataType::Str).is_err());
    }

    #[test]
    fn test_register_packing_high_word_first() {
        // 1.5f32 = 0x3FC00000 packs as [0x3FC0, 0x0000]
        let regs = value_to_registers(&PlcValue::Float(1.5), DataType::Float32).unwrap();
        assert_eq!(regs, vec![0x3FC0, 0x0000]);

        let regs = value_to_registers(&PlcValue::UInt(0x12345678), DataType::UInt32).unwrap();
        assert_eq!(regs, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_register_roundtrip() {
        for (value, ty) in [
            (PlcValue::UInt(0xDEADBEEF), DataType::UInt32),
            (PlcValue::Int(-123456), DataType::Int32),
            (PlcValue::Float(3.25), DataType::Float32),
            (PlcValue::UInt(42), DataType::UInt16),
            (PlcValue::Int(-7), DataType::Int16),
        ] {
            let regs = value_to_registers(&value, ty).unwrap();
            let back = registers_to_value(&regs, ty).unwrap();
            assert_eq!(back, value, "register roundtrip failed for {}", ty);
        }
    }

    #[test]
    fn test_registers_to_value_underflow() {
        assert!(registers_to_value(&[0x1234], DataType::UInt32).is_err());
    }

    #[test]
    fn test_coil_packing() {
        let coils = [true, false, true, false, false, false, false, false, true];
        let packed = pack_coils(&coils);
        assert_eq!(packed, vec![0b0000_0101, 0b0000_0001]);
        assert_eq!(unpack_coils(&packed, 9), coils.to_vec());
    }
}
