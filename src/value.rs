//! # Canonical Value Types
//!
//! Self-contained data types for the gateway's uniform read/write contract.
//! Every protocol driver decodes into [`PlcValue`] and encodes from it, so
//! cross-protocol replication is a typed conversion rather than ad-hoc
//! dispatch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Industrial data type enumeration shared by all protocol drivers.
///
/// The Modbus table types (`Coil`, `DiscreteInput`, `HoldingRegister`,
/// `InputRegister`) select a register table and function code; on other
/// protocols they behave as `Bool`/`UInt16` of the matching width.
///
/// # Width Mapping
///
/// | Type | Bytes | Registers |
/// |------|-------|-----------|
/// | Bool / Coil / DiscreteInput | 1 | — |
/// | UInt8 / Int8 | 1 | 1 |
/// | UInt16 / Int16 / HoldingRegister / InputRegister | 2 | 1 |
/// | UInt32 / Int32 / Float32 | 4 | 2 |
/// | Float64 | 8 | 4 |
/// | Str | variable | — |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    #[serde(rename = "uint8")]
    UInt8,
    Int8,
    #[serde(rename = "uint16")]
    UInt16,
    Int16,
    #[serde(rename = "uint32")]
    UInt32,
    Int32,
    Float32,
    Float64,
    /// Length-prefixed string (S7 convention on the wire).
    #[serde(rename = "string")]
    Str,
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl DataType {
    /// Width of one element in bytes. `Str` reports 0 (variable).
    #[inline]
    pub fn width_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => 1,
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::UInt16
            | DataType::Int16
            | DataType::HoldingRegister
            | DataType::InputRegister => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Str => 0,
        }
    }

    /// Number of 16-bit Modbus registers per element (0 for bit types).
    #[inline]
    pub fn register_count(&self) -> usize {
        match self {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => 0,
            DataType::UInt8
            | DataType::Int8
            | DataType::UInt16
            | DataType::Int16
            | DataType::HoldingRegister
            | DataType::InputRegister => 1,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 2,
            DataType::Float64 => 4,
            DataType::Str => 0,
        }
    }

    /// Whether this type selects a read-only Modbus table.
    #[inline]
    pub fn is_read_only_table(&self) -> bool {
        matches!(self, DataType::DiscreteInput | DataType::InputRegister)
    }

    /// Integer value range `(min, max)` for bounded integer types.
    pub fn integer_range(&self) -> Option<(i64, u64)> {
        match self {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => Some((0, 1)),
            DataType::UInt8 => Some((0, u8::MAX as u64)),
            DataType::Int8 => Some((i8::MIN as i64, i8::MAX as u64)),
            DataType::UInt16 | DataType::HoldingRegister | DataType::InputRegister => {
                Some((0, u16::MAX as u64))
            }
            DataType::Int16 => Some((i16::MIN as i64, i16::MAX as u64)),
            DataType::UInt32 => Some((0, u32::MAX as u64)),
            DataType::Int32 => Some((i32::MIN as i64, i32::MAX as u64)),
            _ => None,
        }
    }

    /// Stable string form, matching the configuration file vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Str => "string",
            DataType::Coil => "coil",
            DataType::DiscreteInput => "discrete_input",
            DataType::HoldingRegister => "holding_register",
            DataType::InputRegister => "input_register",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "uint8" | "u8" | "byte" => Ok(DataType::UInt8),
            "int8" | "i8" => Ok(DataType::Int8),
            "uint16" | "u16" | "word" => Ok(DataType::UInt16),
            "int16" | "i16" | "int" => Ok(DataType::Int16),
            "uint32" | "u32" | "dword" => Ok(DataType::UInt32),
            "int32" | "i32" | "dint" => Ok(DataType::Int32),
            "float32" | "f32" | "float" | "real" => Ok(DataType::Float32),
            "float64" | "f64" | "double" | "lreal" => Ok(DataType::Float64),
            "string" | "str" => Ok(DataType::Str),
            "coil" => Ok(DataType::Coil),
            "discrete_input" => Ok(DataType::DiscreteInput),
            "holding_register" => Ok(DataType::HoldingRegister),
            "input_register" => Ok(DataType::InputRegister),
            other => Err(GatewayError::data(format!(
                "Unsupported data type: {}",
                other
            ))),
        }
    }
}

/// Canonical value variant carried between codec, drivers and replication.
///
/// Integers are stored widened (`i64`/`u64`) so conversions between
/// dissimilar protocol types go through one domain with explicit range
/// checks instead of per-protocol casts.
#[derive(Debug, Clone, PartialEq)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
}

impl PlcValue {
    /// Convert the value to f64 for uniform numeric handling.
    #[inline]
    pub fn as_f64(&self) -> f64 {
        match self {
            PlcValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            PlcValue::Int(v) => *v as f64,
            PlcValue::UInt(v) => *v as f64,
            PlcValue::Float(v) => *v,
            PlcValue::Bytes(_) | PlcValue::Str(_) => 0.0,
        }
    }

    /// Convert the value to i64. Floats are rounded to nearest.
    #[inline]
    pub fn as_i64(&self) -> i64 {
        match self {
            PlcValue::Bool(b) => i64::from(*b),
            PlcValue::Int(v) => *v,
            PlcValue::UInt(v) => *v as i64,
            PlcValue::Float(v) => v.round() as i64,
            PlcValue::Bytes(_) | PlcValue::Str(_) => 0,
        }
    }

    /// Convert the value to u64. Negative values saturate to 0.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        match self {
            PlcValue::Bool(b) => u64::from(*b),
            PlcValue::Int(v) => (*v).max(0) as u64,
            PlcValue::UInt(v) => *v,
            PlcValue::Float(v) => v.round().max(0.0) as u64,
            PlcValue::Bytes(_) | PlcValue::Str(_) => 0,
        }
    }

    /// Truthiness: nonzero numerics and non-empty strings are true.
    #[inline]
    pub fn as_bool(&self) -> bool {
        match self {
            PlcValue::Bool(b) => *b,
            PlcValue::Int(v) => *v != 0,
            PlcValue::UInt(v) => *v != 0,
            PlcValue::Float(v) => *v != 0.0,
            PlcValue::Bytes(b) => !b.is_empty(),
            PlcValue::Str(s) => !s.is_empty(),
        }
    }

    /// Zero/default value for a data type, used for decode underflow.
    pub fn zero_for(data_type: DataType) -> PlcValue {
        match data_type {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => PlcValue::Bool(false),
            DataType::Int8 | DataType::Int16 | DataType::Int32 => PlcValue::Int(0),
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::HoldingRegister
            | DataType::InputRegister => PlcValue::UInt(0),
            DataType::Float32 | DataType::Float64 => PlcValue::Float(0.0),
            DataType::Str => PlcValue::Str(String::new()),
        }
    }

    /// Returns the variant name for logging/debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            PlcValue::Bool(_) => "bool",
            PlcValue::Int(_) => "int",
            PlcValue::UInt(_) => "uint",
            PlcValue::Float(_) => "float",
            PlcValue::Bytes(_) => "bytes",
            PlcValue::Str(_) => "string",
        }
    }

    /// Convert into the canonical representative of `target`.
    ///
    /// This is the conversion step of the replication pipeline: integers
    /// widen with sign preservation, floats keep precision up to the
    /// target width, booleans map to 0/1. Range overflow is a data error;
    /// nothing is clamped.
    pub fn convert(&self, target: DataType) -> GatewayResult<PlcValue> {
        match target {
            DataType::Bool | DataType::Coil | DataType::DiscreteInput => {
                Ok(PlcValue::Bool(self.as_bool()))
            }
            DataType::Str => Ok(PlcValue::Str(match self {
                PlcValue::Str(s) => s.clone(),
                other => other.to_string(),
            })),
            DataType::Float32 => {
                let v = self.as_f64();
                if v.is_finite() && v.abs() > f32::MAX as f64 {
                    return Err(GatewayError::data(format!(
                        "Value {} out of range for float32",
                        v
                    )));
                }
                Ok(PlcValue::Float(v as f32 as f64))
            }
            DataType::Float64 => Ok(PlcValue::Float(self.as_f64())),
            DataType::Int8 | DataType::Int16 | DataType::Int32 => {
                let v = self.checked_integer(target)?;
                Ok(PlcValue::Int(v))
            }
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::HoldingRegister
            | DataType::InputRegister => {
                let v = self.checked_integer(target)?;
                Ok(PlcValue::UInt(v as u64))
            }
        }
    }

    /// Range-checked integer view of this value for a bounded target type.
    fn checked_integer(&self, target: DataType) -> GatewayResult<i64> {
        let (min, max) = target
            .integer_range()
            .ok_or_else(|| GatewayError::data(format!("{} is not an integer type", target)))?;

        if let PlcValue::UInt(v) = self {
            if *v > max {
                return Err(GatewayError::data(format!(
                    "Value {} out of range for {}",
                    v, target
                )));
            }
            return Ok(*v as i64);
        }

        if let PlcValue::Float(v) = self {
            if !v.is_finite() || v.fract() != 0.0 {
                return Err(GatewayError::data(format!(
                    "Value {} is not an integer for {}",
                    v, target
                )));
            }
        }

        let v = self.as_i64();
        if v < min || (v >= 0 && v as u64 > max) {
            return Err(GatewayError::data(format!(
                "Value {} out of range for {}",
                v, target
            )));
        }
        Ok(v)
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(v) => write!(f, "{}", v),
            PlcValue::Int(v) => write!(f, "{}", v),
            PlcValue::UInt(v) => write!(f, "{}", v),
            PlcValue::Float(v) => write!(f, "{}", v),
            PlcValue::Bytes(v) => write!(f, "{} bytes", v.len()),
            PlcValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl Default for PlcValue {
    fn default() -> Self {
        PlcValue::UInt(0)
    }
}

// ============================================================================
// From implementations for ergonomic construction
// ============================================================================

impl From<bool> for PlcValue {
    fn from(v: bool) -> Self {
        PlcValue::Bool(v)
    }
}

impl From<u8> for PlcValue {
    fn from(v: u8) -> Self {
        PlcValue::UInt(v as u64)
    }
}

impl From<i8> for PlcValue {
    fn from(v: i8) -> Self {
        PlcValue::Int(v as i64)
    }
}

impl From<u16> for PlcValue {
    fn from(v: u16) -> Self {
        PlcValue::UInt(v as u64)
    }
}

impl From<i16> for PlcValue {
    fn from(v: i16) -> Self {
        PlcValue::Int(v as i64)
    }
}

impl From<u32> for PlcValue {
    fn from(v: u32) -> Self {
        PlcValue::UInt(v as u64)
    }
}

impl From<i32> for PlcValue {
    fn from(v: i32) -> Self {
        PlcValue::Int(v as i64)
    }
}

impl From<u64> for PlcValue {
    fn from(v: u64) -> Self {
        PlcValue::UInt(v)
    }
}

impl From<i64> for PlcValue {
    fn from(v: i64) -> Self {
        PlcValue::Int(v)
    }
}

impl From<f32> for PlcValue {
    fn from(v: f32) -> Self {
        PlcValue::Float(v as f64)
    }
}

impl From<f64> for PlcValue {
    fn from(v: f64) -> Self {
        PlcValue::Float(v)
    }
}

impl From<&str> for PlcValue {
    fn from(v: &str) -> Self {
        PlcValue::Str(v.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
