use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString};

use super::CodecError;

/// Field key (`AO`, `DI#2`, ...) to property id to entry.
pub type FieldMap = BTreeMap<String, BTreeMap<String, FieldEntry>>;

/// Application-level type of a field, also its Homie datatype.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    Boolean,
    #[default]
    Integer,
    String,
    Float,
    Enum,
}

/// Byte layout of an integer inside the register buffer.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum RegisterEncoding {
    Int8,
    UInt8,
    #[default]
    Int16BE,
    Int16LE,
    UInt16BE,
    UInt16LE,
    Int32BE,
    Int32LE,
    UInt32BE,
    UInt32LE,
}

impl RegisterEncoding {
    pub fn width(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16BE | Self::Int16LE | Self::UInt16BE | Self::UInt16LE => 2,
            Self::Int32BE | Self::Int32LE | Self::UInt32BE | Self::UInt32LE => 4,
        }
    }

    /// Number of 16-bit registers touched by a value of this encoding.
    pub fn registers(self) -> u16 {
        if self.width() == 4 {
            2
        } else {
            1
        }
    }

    pub fn range(self) -> (i64, i64) {
        match self {
            Self::Int8 => (i8::MIN.into(), i8::MAX.into()),
            Self::UInt8 => (0, u8::MAX.into()),
            Self::Int16BE | Self::Int16LE => (i16::MIN.into(), i16::MAX.into()),
            Self::UInt16BE | Self::UInt16LE => (0, u16::MAX.into()),
            Self::Int32BE | Self::Int32LE => (i32::MIN.into(), i32::MAX.into()),
            Self::UInt32BE | Self::UInt32LE => (0, u32::MAX.into()),
        }
    }

    pub fn check(self, value: i64) -> Result<(), CodecError> {
        let (min, max) = self.range();
        if value < min || value > max {
            return Err(CodecError::OutOfRange {
                value,
                encoding: self,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Writes a range-checked value at byte `at` of `buffer`.
    pub fn write(self, value: i64, buffer: &mut [u8], at: usize) -> Result<(), CodecError> {
        self.check(value)?;
        let slot = buffer
            .get_mut(at..at + self.width())
            .ok_or(CodecError::AddressOutOfRange { address: at as i64 })?;
        match self {
            Self::Int8 | Self::UInt8 => slot[0] = value as u8,
            Self::Int16BE | Self::UInt16BE => slot.copy_from_slice(&(value as u16).to_be_bytes()),
            Self::Int16LE | Self::UInt16LE => slot.copy_from_slice(&(value as u16).to_le_bytes()),
            Self::Int32BE | Self::UInt32BE => slot.copy_from_slice(&(value as u32).to_be_bytes()),
            Self::Int32LE | Self::UInt32LE => slot.copy_from_slice(&(value as u32).to_le_bytes()),
        }
        Ok(())
    }

    pub fn read(self, buffer: &[u8], at: usize) -> Option<i64> {
        let bytes = buffer.get(at..at + self.width())?;
        let value = match self {
            Self::Int8 => i64::from(bytes[0] as i8),
            Self::UInt8 => i64::from(bytes[0]),
            Self::Int16BE => i64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
            Self::Int16LE => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::UInt16BE => i64::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            Self::UInt16LE => i64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            Self::Int32BE => i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::Int32LE => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::UInt32BE => i64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::UInt32LE => i64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };
        Some(value)
    }
}

/// One addressable value inside a register class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    #[serde(default)]
    pub address: Option<i64>,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(alias = "libelle", default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<RegisterEncoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(rename = "encodeInt", default, skip_serializing_if = "Option::is_none")]
    pub encode_int: Option<u32>,
}

impl FieldEntry {
    /// Bit position used for booleans stored in a register; bit 0 when unset.
    pub fn bit_offset(&self) -> Option<i64> {
        match self.value_type {
            ValueType::Boolean => Some(self.offset.unwrap_or(0)),
            _ => self.offset,
        }
    }

    /// Encoding actually used for integer and string fields.
    pub fn encoding(&self) -> RegisterEncoding {
        match (self.offset, self.register) {
            (Some(_), Some(RegisterEncoding::Int8)) => RegisterEncoding::Int8,
            (Some(_), _) => RegisterEncoding::UInt8,
            (None, register) => register.unwrap_or_default(),
        }
    }

    /// Registers covered by this field inside a register table.
    pub fn register_span(&self) -> u16 {
        match self.value_type {
            ValueType::Integer | ValueType::String if self.offset.is_none() => {
                self.encoding().registers()
            }
            _ => 1,
        }
    }

    pub fn radix(&self) -> u32 {
        self.encode_int.unwrap_or(10)
    }

    pub fn display_label<'a>(&'a self, property: &'a str) -> &'a str {
        if self.label.is_empty() {
            property
        } else {
            &self.label
        }
    }
}

/// A raw scalar taken from a response, before field decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    Bool(bool),
    Number(i64),
}

/// A decoded, typed field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
}

impl FieldValue {
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::Int(value) => value != 0,
        }
    }

    pub fn as_int(self) -> i64 {
        match self {
            Self::Bool(value) => i64::from(value),
            Self::Int(value) => value,
        }
    }

    /// Parses an inbound payload according to the entry type.
    ///
    /// Booleans never fail: `false` and `0` are false, anything else is true.
    pub fn parse(entry: &FieldEntry, payload: &str) -> Result<Self, CodecError> {
        let payload = payload.trim();
        match entry.value_type {
            ValueType::Boolean => Ok(Self::Bool(
                !(payload.eq_ignore_ascii_case("false") || payload == "0"),
            )),
            ValueType::Integer | ValueType::String => {
                let radix = checked_radix(entry.radix())?;
                i64::from_str_radix(payload, radix)
                    .map(Self::Int)
                    .map_err(|_| CodecError::InvalidValue {
                        payload: payload.to_string(),
                        value_type: entry.value_type,
                    })
            }
            value_type => Err(CodecError::NotImplemented { value_type }),
        }
    }

    /// Interprets a configured `default`.
    pub fn from_json(entry: &FieldEntry, value: &serde_json::Value) -> Result<Self, CodecError> {
        match value {
            serde_json::Value::Bool(flag) => Ok(match entry.value_type {
                ValueType::Boolean => Self::Bool(*flag),
                _ => Self::Int(i64::from(*flag)),
            }),
            serde_json::Value::Number(number) => match (entry.value_type, number.as_i64()) {
                (ValueType::Boolean, Some(number)) => Ok(Self::Bool(number != 0)),
                (_, Some(number)) => Ok(Self::Int(number)),
                _ => Err(CodecError::InvalidValue {
                    payload: number.to_string(),
                    value_type: entry.value_type,
                }),
            },
            serde_json::Value::String(text) => Self::parse(entry, text),
            other => Err(CodecError::InvalidValue {
                payload: other.to_string(),
                value_type: entry.value_type,
            }),
        }
    }

    /// Payload published for this value.
    pub fn format(self, entry: &FieldEntry) -> String {
        match (entry.value_type, self) {
            (ValueType::Boolean, value) => value.as_bool().to_string(),
            (_, value) => format_radix(value.as_int(), entry.radix()),
        }
    }
}

pub(crate) fn checked_radix(radix: u32) -> Result<u32, CodecError> {
    if (2..=36).contains(&radix) {
        Ok(radix)
    } else {
        Err(CodecError::InvalidRadix { radix })
    }
}

fn format_radix(value: i64, radix: u32) -> String {
    if radix == 10 || !(2..=36).contains(&radix) {
        return value.to_string();
    }
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while magnitude > 0 {
        let digit = (magnitude % u64::from(radix)) as u32;
        digits.extend(char::from_digit(digit, radix));
        magnitude /= u64::from(radix);
    }
    if value < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}
