//! # Address Resolver
//!
//! Parses human-readable PLC addresses (`I0.0`, `DB1.DBW0`, `ns=2;s=Tag1`)
//! into resolved `(area, offset, width, bit)` tuples. Resolution is purely
//! syntactic; semantics (which areas a protocol accepts, whether a write is
//! legal) are enforced by the target driver.
//!
//! Accepted grammar:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `I<byte>.<bit>` / `Q<byte>.<bit>` / `M<byte>.<bit>` | bit in PE / PA / MK |
//! | `IB<byte>` `IW<byte>` `ID<byte>` (also `Q`, `M`) | 1/2/4-byte access |
//! | `DB<n>.DBB<byte>` / `DBW` / `DBD` | data block, width 1/2/4 |
//! | `DB<n>.DBX<byte>.<bit>` | single bit in a data block |
//! | `T<n>` / `C<n>` | timer / counter word |
//! | `ns=<u>;s=<str>` `ns=<u>;i=<int>` `i=<int>` or bare string | OPC UA NodeId |
//!
//! `A<byte>.<bit>` and `AB/AW/AD<byte>` are accepted as localized aliases
//! for the `Q` output forms and canonicalize to `Q` on display.

use std::fmt;

use crate::error::{GatewayError, GatewayResult};

/// S7/Profibus memory areas with their on-wire area codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryArea {
    /// Process inputs (read-only).
    Pe,
    /// Process outputs.
    Pa,
    /// Merkers (internal flags).
    Mk,
    /// Data blocks.
    Db,
    /// Timers.
    Tm,
    /// Counters.
    Ct,
    /// System data (read-only).
    Sys,
    /// System information (read-only).
    SysInfo,
    /// System flags (read-only).
    SysFlags,
}

impl MemoryArea {
    /// On-wire S7 area code.
    pub fn code(&self) -> u8 {
        match self {
            MemoryArea::Pe => 0x81,
            MemoryArea::Pa => 0x82,
            MemoryArea::Mk => 0x83,
            MemoryArea::Db => 0x84,
            MemoryArea::Tm => 0x1D,
            MemoryArea::Ct => 0x1C,
            MemoryArea::Sys => 0x03,
            MemoryArea::SysInfo => 0x04,
            MemoryArea::SysFlags => 0x05,
        }
    }

    /// Whether writes into this area are rejected before transport.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            MemoryArea::Pe | MemoryArea::Sys | MemoryArea::SysInfo | MemoryArea::SysFlags
        )
    }

    fn prefix(&self) -> &'static str {
        match self {
            MemoryArea::Pe => "I",
            MemoryArea::Pa => "Q",
            MemoryArea::Mk => "M",
            MemoryArea::Db => "DB",
            MemoryArea::Tm => "T",
            MemoryArea::Ct => "C",
            MemoryArea::Sys => "SYS",
            MemoryArea::SysInfo => "SYS_INFO",
            MemoryArea::SysFlags => "SYS_FLAGS",
        }
    }
}

/// OPC UA NodeId identifier part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentifier {
    Numeric(u32),
    Text(String),
}

/// A fully resolved address. Each variant carries an implicit width.
#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    /// Single bit: `I0.0`, `Q0.3`, `M2.7`.
    Bit {
        area: MemoryArea,
        byte: u32,
        bit: u8,
    },
    /// One byte: `IB0`, `QB1`, `MB2`.
    Byte { area: MemoryArea, byte: u32 },
    /// One word: `IW0`, `QW96`, `MW10`.
    Word { area: MemoryArea, byte: u32 },
    /// One double word: `ID100`, `QD4`, `MD20`.
    DWord { area: MemoryArea, byte: u32 },
    /// Data block access of width 1/2/4, optionally a single bit.
    Db {
        db_number: u16,
        byte: u32,
        width: u8,
        bit: Option<u8>,
    },
    /// Timer word: `T5`.
    Timer { number: u16 },
    /// Counter word: `C5`.
    Counter { number: u16 },
    /// OPC UA NodeId.
    OpcUaNode {
        namespace: u16,
        identifier: NodeIdentifier,
    },
}

impl Address {
    /// Parse an address string into its resolved form.
    pub fn parse(address: &str) -> GatewayResult<Address> {
        let s = address.trim();
        if s.is_empty() {
            return Err(err(address, "empty address"));
        }

        // OPC UA node ids first; `ns=` / `i=` prefixes are unambiguous.
        if s.starts_with("ns=") || s.starts_with("i=") {
            return parse_node_id(address, s);
        }

        if let Some(rest) = s.strip_prefix("DB").or_else(|| s.strip_prefix("db")) {
            return parse_db(address, rest);
        }

        let mut chars = s.chars();
        let head = chars.next().unwrap().to_ascii_uppercase();
        let tail: &str = &s[head.len_utf8()..];

        match head {
            'I' | 'Q' | 'M' | 'A' | 'E' if looks_like_iqm(tail) => {
                // `A` is the localized output alias, `E` the input alias.
                let area = match head {
                    'I' | 'E' => MemoryArea::Pe,
                    'Q' | 'A' => MemoryArea::Pa,
                    _ => MemoryArea::Mk,
                };
                parse_iqm(address, area, tail)
            }
            'T' if is_all_digits(tail) => {
                let number = parse_number(address, tail, "timer number")?;
                Ok(Address::Timer { number })
            }
            'C' if is_all_digits(tail) => {
                let number = parse_number(address, tail, "counter number")?;
                Ok(Address::Counter { number })
            }
            _ => {
                // Anything else is an OPC UA symbolic node in namespace 0.
                if s.chars().all(|c| c.is_ascii_digit()) {
                    return Err(err(address, "bare numeric address has no area"));
                }
                Ok(Address::OpcUaNode {
                    namespace: 0,
                    identifier: NodeIdentifier::Text(s.to_string()),
                })
            }
        }
    }

    /// Width of the addressed element in bytes. Bit addresses report 1.
    pub fn width_bytes(&self) -> usize {
        match self {
            Address::Bit { .. } | Address::Byte { .. } => 1,
            Address::Word { .. } | Address::Timer { .. } | Address::Counter { .. } => 2,
            Address::DWord { .. } => 4,
            Address::Db { width, .. } => *width as usize,
            Address::OpcUaNode { .. } => 0,
        }
    }

    /// Memory area of this address, if it is an S7-style address.
    pub fn area(&self) -> Option<MemoryArea> {
        match self {
            Address::Bit { area, .. }
            | Address::Byte { area, .. }
            | Address::Word { area, .. }
            | Address::DWord { area, .. } => Some(*area),
            Address::Db { .. } => Some(MemoryArea::Db),
            Address::Timer { .. } => Some(MemoryArea::Tm),
            Address::Counter { .. } => Some(MemoryArea::Ct),
            Address::OpcUaNode { .. } => None,
        }
    }

    /// Bit position for bit addresses.
    pub fn bit(&self) -> Option<u8> {
        match self {
            Address::Bit { bit, .. } => Some(*bit),
            Address::Db { bit, .. } => *bit,
            _ => None,
        }
    }
}

fn err(address: &str, reason: &str) -> GatewayError {
    GatewayError::address(address, reason)
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Whether the tail after an I/Q/M/A/E prefix has the S7 shape
/// (`<digit>…` or `B/W/D<digit>…`). Anything else falls back to an OPC UA
/// symbolic node, so plain tag names starting with these letters parse.
fn looks_like_iqm(tail: &str) -> bool {
    let mut chars = tail.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some(c) if matches!(c.to_ascii_uppercase(), 'B' | 'W' | 'D') => {
            chars.next().is_some_and(|d| d.is_ascii_digit())
        }
        _ => false,
    }
}

fn parse_number<T: std::str::FromStr>(
    address: &str,
    text: &str,
    what: &str,
) -> GatewayResult<T> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(err(address, &format!("invalid {}", what)));
    }
    text.parse::<T>()
        .map_err(|_| err(address, &format!("{} out of range", what)))
}

fn parse_iqm(address: &str, area: MemoryArea, tail: &str) -> GatewayResult<Address> {
    if tail.is_empty() {
        return Err(err(address, "missing offset"));
    }

    let width_char = tail.chars().next().unwrap().to_ascii_uppercase();
    if matches!(width_char, 'B' | 'W' | 'D') {
        let byte = parse_number(address, &tail[1..], "byte offset")?;
        return Ok(match width_char {
            'B' => Address::Byte { area, byte },
            'W' => Address::Word { area, byte },
            _ => Address::DWord { area, byte },
        });
    }

    // Bit form: <byte>.<bit>
    let (byte_part, bit_part) = tail
        .split_once('.')
        .ok_or_else(|| err(address, "expected <byte>.<bit> or B/W/D<byte>"))?;
    let byte = parse_number(address, byte_part, "byte offset")?;
    let bit: u8 = parse_number(address, bit_part, "bit position")?;
    if bit > 7 {
        return Err(err(address, "bit position must be 0-7"));
    }
    Ok(Address::Bit { area, byte, bit })
}

fn parse_db(address: &str, rest: &str) -> GatewayResult<Address> {
    let (num_part, var_part) = rest
        .split_once('.')
        .ok_or_else(|| err(address, "expected DB<n>.DB[BWDX]<byte>"))?;
    let db_number: u16 = parse_number(address, num_part, "DB number")?;

    let var = var_part.to_ascii_uppercase();
    let spec = var
        .strip_prefix("DB")
        .ok_or_else(|| err(address, "expected DBB/DBW/DBD/DBX after DB number"))?;
    if spec.is_empty() {
        return Err(err(address, "missing width specifier"));
    }

    let kind = spec.chars().next().unwrap();
    let offset_text = &spec[1..];
    match kind {
        'B' | 'W' | 'D' => {
            let byte = parse_number(address, offset_text, "byte offset")?;
            let width = match kind {
                'B' => 1,
                'W' => 2,
                _ => 4,
            };
            Ok(Address::Db {
                db_number,
                byte,
                width,
                bit: None,
            })
        }
        'X' => {
            let (byte_part, bit_part) = offset_text
                .split_once('.')
                .ok_or_else(|| err(address, "DBX requires <byte>.<bit>"))?;
            let byte = parse_number(address, byte_part, "byte offset")?;
            let bit: u8 = parse_number(address, bit_part, "bit position")?;
            if bit > 7 {
                return Err(err(address, "bit position must be 0-7"));
            }
            Ok(Address::Db {
                db_number,
                byte,
                width: 1,
                bit: Some(bit),
            })
        }
        _ => Err(err(address, "unknown DB width specifier")),
    }
}

fn parse_node_id(address: &str, s: &str) -> GatewayResult<Address> {
    let mut namespace: u16 = 0;
    let mut rest = s;

    if let Some(after) = rest.strip_prefix("ns=") {
        let (ns_part, id_part) = after
            .split_once(';')
            .ok_or_else(|| err(address, "expected ';' after namespace index"))?;
        namespace = parse_number(address, ns_part, "namespace index")?;
        rest = id_part;
    }

    if let Some(text) = rest.strip_prefix("s=") {
        if text.is_empty() {
            return Err(err(address, "empty string identifier"));
        }
        return Ok(Address::OpcUaNode {
            namespace,
            identifier: NodeIdentifier::Text(text.to_string()),
        });
    }
    if let Some(num) = rest.strip_prefix("i=") {
        let id: u32 = parse_number(address, num, "numeric identifier")?;
        return Ok(Address::OpcUaNode {
            namespace,
            identifier: NodeIdentifier::Numeric(id),
        });
    }
    Err(err(address, "expected s=<string> or i=<int> identifier"))
}

impl fmt::Display for Address {
    /// Emits the canonical form; parsing it back yields the same address.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Bit { area, byte, bit } => write!(f, "{}{}.{}", area.prefix(), byte, bit),
            Address::Byte { area, byte } => write!(f, "{}B{}", area.prefix(), byte),
            Address::Word { area, byte } => write!(f, "{}W{}", area.prefix(), byte),
            Address::DWord { area, byte } => write!(f, "{}D{}", area.prefix(), byte),
            Address::Db {
                db_number,
                byte,
                width,
                bit,
            } => match bit {
                Some(b) => write!(f, "DB{}.DBX{}.{}", db_number, byte, b),
                None => {
                    let w = match width {
                        1 => 'B',
                        2 => 'W',
                        _ => 'D',
                    };
                    write!(f, "DB{}.DB{}{}", db_number, w, byte)
                }
            },
            Address::Timer { number } => write!(f, "T{}", number),
            Address::Counter { number } => write!(f, "C{}", number),
            Address::OpcUaNode {
                namespace,
                identifier,
            } => {
                if *namespace != 0 {
                    write!(f, "ns={};", namespace)?;
                    match identifier {
                        NodeIdentifier::Text(s) => write!(f, "s={}", s),
                        NodeIdentifier::Numeric(i) => write!(f, "i={}", i),
                    }
                } else {
                    match identifier {
                        // Bare string is the canonical namespace-0 form.
                        NodeIdentifier::Text(s) => write!(f, "{}", s),
                        NodeIdentifier::Numeric(i) => write!(f, "i={}", i),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_addresses() {
        assert_eq!(
            Address::parse("I0.0").unwrap(),
            Address::Bit {
                area: MemoryArea::Pe,
                byte: 0,
                bit: 0
            }
        );
        assert_eq!(
            Address::parse("Q0.3").unwrap(),
            Address::Bit {
                area: MemoryArea::Pa,
                byte: 0,
                bit: 3
            }
        );
        assert_eq!(
            Address::parse("M12.7").unwrap(),
            Address::Bit {
                area: MemoryArea::Mk,
                byte: 12,
                bit: 7
            }
        );
    }

    #[test]
    fn test_localized_output_alias() {
        // A0.3 is the localized spelling of Q0.3 and resolves identically.
        assert_eq!(Address::parse("A0.3").unwrap(), Address::parse("Q0.3").unwrap());
        assert_eq!(Address::parse("A0.3").unwrap().to_string(), "Q0.3");
        assert_eq!(Address::parse("AB2").unwrap(), Address::parse("QB2").unwrap());
        assert_eq!(Address::parse("E1.0").unwrap(), Address::parse("I1.0").unwrap());
    }

    #[test]
    fn test_width_addresses() {
        assert_eq!(
            Address::parse("IB0").unwrap(),
            Address::Byte {
                area: MemoryArea::Pe,
                byte: 0
            }
        );
        assert_eq!(
            Address::parse("QW96").unwrap(),
            Address::Word {
                area: MemoryArea::Pa,
                byte: 96
            }
        );
        assert_eq!(
            Address::parse("MD20").unwrap(),
            Address::DWord {
                area: MemoryArea::Mk,
                byte: 20
            }
        );
        assert_eq!(Address::parse("IB0").unwrap().width_bytes(), 1);
        assert_eq!(Address::parse("QW96").unwrap().width_bytes(), 2);
        assert_eq!(Address::parse("MD20").unwrap().width_bytes(), 4);
    }

    #[test]
    fn test_db_addresses() {
        assert_eq!(
            Address::parse("DB1.DBW0").unwrap(),
            Address::Db {
                db_number: 1,
                byte: 0,
                width: 2,
                bit: None
            }
        );
        assert_eq!(
            Address::parse("DB2.DBD10").unwrap(),
            Address::Db {
                db_number: 2,
                byte: 10,
                width: 4,
                bit: None
            }
        );
        assert_eq!(
            Address::parse("DB3.DBX5.0").unwrap(),
            Address::Db {
                db_number: 3,
                byte: 5,
                width: 1,
                bit: Some(0)
            }
        );
    }

    #[test]
    fn test_timer_counter() {
        assert_eq!(Address::parse("T5").unwrap(), Address::Timer { number: 5 });
        assert_eq!(Address::parse("C10").unwrap(), Address::Counter { number: 10 });
        assert_eq!(Address::parse("T5").unwrap().width_bytes(), 2);
    }

    #[test]
    fn test_opcua_node_ids() {
        assert_eq!(
            Address::parse("ns=2;s=Tag1").unwrap(),
            Address::OpcUaNode {
                namespace: 2,
                identifier: NodeIdentifier::Text("Tag1".into())
            }
        );
        assert_eq!(
            Address::parse("ns=3;i=1001").unwrap(),
            Address::OpcUaNode {
                namespace: 3,
                identifier: NodeIdentifier::Numeric(1001)
            }
        );
        assert_eq!(
            Address::parse("i=84").unwrap(),
            Address::OpcUaNode {
                namespace: 0,
                identifier: NodeIdentifier::Numeric(84)
            }
        );
        assert_eq!(
            Address::parse("ServerStatus").unwrap(),
            Address::OpcUaNode {
                namespace: 0,
                identifier: NodeIdentifier::Text("ServerStatus".into())
            }
        );
        // Tag names starting with S7 prefix letters stay symbolic.
        for tag in ["Tank_Level", "Ignition", "Motor1.Speed", "Count"] {
            assert!(matches!(
                Address::parse(tag).unwrap(),
                Address::OpcUaNode { namespace: 0, .. }
            ));
        }
    }

    #[test]
    fn test_rejections() {
        for bad in [
            "", "I0.8", "Q0.9", "DB1.DBQ0", "DB1", "ns=2;x=1", "ns=;s=a", "DB1.DBX5", "42",
            "DB1.DBX5.8", "IW1x",
        ] {
            let result = Address::parse(bad);
            assert!(result.is_err(), "expected rejection for '{}'", bad);
            if let Err(GatewayError::Address { address, .. }) = result {
                assert_eq!(address, bad);
            } else {
                panic!("expected address error for '{}'", bad);
            }
        }
    }

    #[test]
    fn test_canonical_reparse_identity() {
        for text in [
            "I0.0", "Q0.3", "M2.7", "IB0", "QW96", "MD20", "DB1.DBW0", "DB2.DBD10",
            "DB3.DBX5.0", "T5", "C10", "ns=2;s=Tag1", "ns=3;i=1001", "i=84", "MyTag",
        ] {
            let parsed = Address::parse(text).unwrap();
            let emitted = parsed.to_string();
            let reparsed = Address::parse(&emitted).unwrap();
            assert_eq!(parsed, reparsed, "reparse identity failed for '{}'", text);
        }
    }

    #[test]
    fn test_read_only_areas() {
        assert!(MemoryArea::Pe.is_read_only());
        assert!(MemoryArea::Sys.is_read_only());
        assert!(MemoryArea::SysInfo.is_read_only());
        assert!(MemoryArea::SysFlags.is_read_only());
        assert!(!MemoryArea::Pa.is_read_only());
        assert!(!MemoryArea::Db.is_read_only());
        assert!(!MemoryArea::Mk.is_read_only());
    }

    #[test]
    fn test_area_codes() {
        assert_eq!(MemoryArea::Pe.code(), 0x81);
        assert_eq!(MemoryArea::Pa.code(), 0x82);
        assert_eq!(MemoryArea::Mk.code(), 0x83);
        assert_eq!(MemoryArea::Db.code(), 0x84);
        assert_eq!(MemoryArea::Ct.code(), 0x1C);
        assert_eq!(MemoryArea::Tm.code(), 0x1D);
    }
}
