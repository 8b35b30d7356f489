/// Register codec
///
/// Pure conversions between a field's configured position and concrete
/// byte/bit positions in a register buffer, and between raw register
/// contents and typed field values.
///
/// Register buffers are big-endian word arrays: register `r` occupies bytes
/// `2r` (bits 8..=15) and `2r + 1` (bits 0..=7).
use regex::Regex;
use std::sync::OnceLock;

use super::{
    field::checked_radix, CodecError, FieldEntry, FieldValue, RawValue, RegisterEncoding,
    ValueType,
};

fn digits_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[0-9]+").unwrap_or_else(|err| unreachable!("digit pattern: {err}"))
    })
}

/// Register (or bit) index of a field.
///
/// Uses `address - addressing_offset` when an address is configured,
/// otherwise every digit of `key` joined in order (`"T1-40001"` is 140001).
pub fn register_address(
    key: &str,
    address: Option<i64>,
    addressing_offset: i64,
) -> Result<i64, CodecError> {
    let base = match address {
        Some(address) => address,
        None => digits_pattern()
            .find_iter(key)
            .map(|digits| digits.as_str())
            .collect::<String>()
            .parse::<i64>()
            .map_err(|_| CodecError::MissingAddress {
                key: key.to_string(),
            })?,
    };
    Ok(base - addressing_offset)
}

/// Byte offset of a field inside a register buffer.
///
/// Bits 8..=15 live in the first byte of the register, bits 0..=7 in the second.
pub fn buffer_address(
    key: &str,
    address: Option<i64>,
    addressing_offset: i64,
    bit_offset: Option<i64>,
) -> Result<i64, CodecError> {
    let register = register_address(key, address, addressing_offset)?;
    let low_byte = match bit_offset {
        None | Some(8..=15) => 0,
        Some(0..=7) => 1,
        Some(offset) => return Err(CodecError::InvalidOffset { offset }),
    };
    Ok(register * 2 + low_byte)
}

/// Register index checked against the 16-bit address space.
pub fn checked_register(
    key: &str,
    address: Option<i64>,
    addressing_offset: i64,
) -> Result<u16, CodecError> {
    let register = register_address(key, address, addressing_offset)?;
    u16::try_from(register).map_err(|_| CodecError::AddressOutOfRange { address: register })
}

/// Decodes a raw scalar for `entry` and hands the result to `emit`.
///
/// `emit` is not called when the entry type has no decoding, or for a
/// boolean read from a register word without a bit offset.
pub fn decode_value(entry: &FieldEntry, raw: RawValue, emit: impl FnOnce(FieldValue)) {
    match (entry.value_type, raw) {
        (ValueType::Float | ValueType::Enum, _) => {}
        (ValueType::Boolean, RawValue::Bool(flag)) => emit(FieldValue::Bool(flag)),
        (_, RawValue::Bool(flag)) => emit(FieldValue::Int(i64::from(flag))),
        (ValueType::Boolean, RawValue::Number(word)) => {
            if let Some(offset) = entry.offset {
                emit(FieldValue::Bool((word >> offset) & 1 == 1));
            }
        }
        (_, RawValue::Number(word)) => match entry.offset {
            Some(0) => emit(FieldValue::Int(word & 0xff)),
            Some(8) => emit(FieldValue::Int((word >> 8) & 0xff)),
            _ => emit(FieldValue::Int(word)),
        },
    }
}

/// Reads the field stored at `byte_address` of a register buffer.
///
/// `byte_address` comes from [`buffer_address`] (relative to the buffer start).
pub fn read_field(
    entry: &FieldEntry,
    buffer: &[u8],
    byte_address: usize,
) -> Result<Option<FieldValue>, CodecError> {
    let out_of_range = || CodecError::AddressOutOfRange {
        address: byte_address as i64,
    };
    let mut decoded = None;
    match entry.value_type {
        ValueType::Float | ValueType::Enum => {}
        ValueType::Boolean => {
            let word = register_word(buffer, byte_address).ok_or_else(out_of_range)?;
            let entry = FieldEntry {
                offset: entry.bit_offset(),
                ..entry.clone()
            };
            decode_value(&entry, RawValue::Number(word), |value| decoded = Some(value));
        }
        ValueType::Integer | ValueType::String if entry.offset.is_some() => {
            let word = register_word(buffer, byte_address).ok_or_else(out_of_range)?;
            decode_value(entry, RawValue::Number(word), |value| {
                decoded = Some(match (entry.encoding(), value) {
                    (RegisterEncoding::Int8, FieldValue::Int(byte)) => {
                        FieldValue::Int(i64::from(byte as u8 as i8))
                    }
                    (_, value) => value,
                })
            });
        }
        ValueType::Integer | ValueType::String => {
            let value = entry
                .encoding()
                .read(buffer, byte_address)
                .ok_or_else(out_of_range)?;
            decode_value(entry, RawValue::Number(value), |value| decoded = Some(value));
        }
    }
    Ok(decoded)
}

fn register_word(buffer: &[u8], byte_address: usize) -> Option<i64> {
    let start = byte_address - byte_address % 2;
    let bytes = buffer.get(start..start + 2)?;
    Some(i64::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

/// Writes `value` for `entry` into a register buffer at `byte_address`.
///
/// Values are validated before any byte is touched.
pub fn encode_value(
    entry: &FieldEntry,
    value: FieldValue,
    buffer: &mut [u8],
    byte_address: usize,
) -> Result<(), CodecError> {
    match entry.value_type {
        ValueType::Float | ValueType::Enum => Err(CodecError::NotImplemented {
            value_type: entry.value_type,
        }),
        ValueType::Boolean => {
            let bit = match entry.bit_offset() {
                Some(offset @ 0..=15) => offset % 8,
                Some(offset) => return Err(CodecError::InvalidOffset { offset }),
                None => 0,
            };
            let byte = buffer
                .get_mut(byte_address)
                .ok_or(CodecError::AddressOutOfRange {
                    address: byte_address as i64,
                })?;
            if value.as_bool() {
                *byte |= 1 << bit;
            } else {
                *byte &= !(1 << bit);
            }
            Ok(())
        }
        ValueType::Integer | ValueType::String => {
            entry
                .encoding()
                .write(value.as_int(), buffer, byte_address)
        }
    }
}

/// Checks the offset, type and encoding combination of an entry.
pub fn validate_field_entry(entry: &FieldEntry) -> Result<(), CodecError> {
    match entry.value_type {
        ValueType::Float | ValueType::Enum => {
            return Err(CodecError::NotImplemented {
                value_type: entry.value_type,
            })
        }
        ValueType::Boolean => {
            if let Some(offset) = entry.offset {
                if !(0..=15).contains(&offset) {
                    return Err(CodecError::InvalidOffset { offset });
                }
            }
        }
        ValueType::Integer | ValueType::String => {
            checked_radix(entry.radix())?;
            if let Some(offset) = entry.offset {
                if !(0..=15).contains(&offset) {
                    return Err(CodecError::InvalidOffset { offset });
                }
                let unsupported = offset != 0 && offset != 8;
                let wide = entry.register.is_some_and(|encoding| encoding.width() > 1);
                if unsupported || wide {
                    return Err(CodecError::UnsupportedOffset {
                        offset,
                        value_type: entry.value_type,
                        encoding: entry.register.unwrap_or(entry.encoding()),
                    });
                }
            }
        }
    }
    if let Some(default) = &entry.default {
        let value = FieldValue::from_json(entry, default)?;
        if entry.value_type != ValueType::Boolean {
            entry.encoding().check(value.as_int())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn integer(register: RegisterEncoding) -> FieldEntry {
        FieldEntry {
            value_type: ValueType::Integer,
            register: Some(register),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_address() {
        assert_eq!(register_address("temperature", Some(10), 0), Ok(10));
        assert_eq!(register_address("temperature", Some(10), 1), Ok(9));
        assert_eq!(register_address("key-12", None, 0), Ok(12));
        assert_eq!(register_address("key-12", None, 2), Ok(10));
        assert_eq!(register_address("T1-40001", None, 0), Ok(140001));
        assert_eq!(register_address("T1-40001", None, 40001), Ok(100000));
        assert_eq!(
            register_address("key", None, 0),
            Err(CodecError::MissingAddress {
                key: "key".to_string()
            })
        );
    }

    #[test]
    fn test_buffer_address_byte_halves() {
        assert_eq!(buffer_address("key-0", None, 0, Some(8)), Ok(0));
        assert_eq!(buffer_address("key-0", None, 0, Some(15)), Ok(0));
        assert_eq!(buffer_address("key-0", None, 0, Some(0)), Ok(1));
        assert_eq!(buffer_address("key-0", None, 0, Some(7)), Ok(1));
        assert_eq!(buffer_address("key-1", None, 0, Some(0)), Ok(3));
        assert_eq!(buffer_address("key-1", None, 0, None), Ok(2));
        assert_eq!(
            buffer_address("key-0", None, 0, Some(8)),
            buffer_address("key-0", None, 0, Some(8))
        );
    }

    #[test]
    fn test_buffer_address_invalid_offset() {
        assert_eq!(
            buffer_address("key-0", None, 0, Some(16)),
            Err(CodecError::InvalidOffset { offset: 16 })
        );
        assert_eq!(
            buffer_address("key-0", None, 0, Some(-1)),
            Err(CodecError::InvalidOffset { offset: -1 })
        );
    }

    #[test]
    fn test_range_limits() {
        let cases = [
            (RegisterEncoding::Int16BE, -32768, 32767),
            (RegisterEncoding::Int16LE, -32768, 32767),
            (RegisterEncoding::UInt16BE, 0, 65535),
            (RegisterEncoding::UInt16LE, 0, 65535),
            (RegisterEncoding::Int32BE, i32::MIN as i64, i32::MAX as i64),
            (RegisterEncoding::UInt32LE, 0, u32::MAX as i64),
            (RegisterEncoding::Int8, -128, 127),
            (RegisterEncoding::UInt8, 0, 255),
        ];
        for (encoding, min, max) in cases {
            let entry = integer(encoding);
            let mut buffer = [0u8; 4];
            assert!(encode_value(&entry, FieldValue::Int(min), &mut buffer, 0).is_ok());
            assert!(encode_value(&entry, FieldValue::Int(max), &mut buffer, 0).is_ok());
            assert_eq!(
                encode_value(&entry, FieldValue::Int(max + 1), &mut buffer, 0),
                Err(CodecError::OutOfRange {
                    value: max + 1,
                    encoding,
                    min,
                    max
                })
            );
            assert!(matches!(
                encode_value(&entry, FieldValue::Int(min - 1), &mut buffer, 0),
                Err(CodecError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_out_of_range_leaves_buffer_untouched() {
        let entry = integer(RegisterEncoding::UInt16BE);
        let mut buffer = [0xAAu8, 0x55];
        assert!(encode_value(&entry, FieldValue::Int(-1), &mut buffer, 0).is_err());
        assert_eq!(buffer, [0xAA, 0x55]);
    }

    #[test]
    fn test_round_trip_at_bounds() {
        for encoding in RegisterEncoding::iter() {
            let entry = integer(encoding);
            let (min, max) = encoding.range();
            for value in [min, max, (min + max) / 2] {
                let mut buffer = [0u8; 6];
                encode_value(&entry, FieldValue::Int(value), &mut buffer, 2).unwrap();
                assert_eq!(
                    read_field(&entry, &buffer, 2),
                    Ok(Some(FieldValue::Int(value))),
                    "{encoding} {value}"
                );
            }
        }
    }

    #[test]
    fn test_uint16be_54321() {
        let entry = integer(RegisterEncoding::UInt16BE);
        let mut buffer = [0u8; 2];
        encode_value(&entry, FieldValue::Int(54321), &mut buffer, 0).unwrap();
        assert_eq!(buffer, 54321u16.to_be_bytes());
        assert_eq!(
            read_field(&entry, &buffer, 0),
            Ok(Some(FieldValue::Int(54321)))
        );
    }

    #[test]
    fn test_booleans_skip_range_checks() {
        let entry = FieldEntry {
            value_type: ValueType::Boolean,
            offset: Some(9),
            ..Default::default()
        };
        let byte_address = buffer_address("flag", Some(0), 0, entry.bit_offset()).unwrap() as usize;
        let mut buffer = [0u8; 2];
        for value in [FieldValue::Int(70000), FieldValue::Int(-5), FieldValue::Bool(true)] {
            encode_value(&entry, value, &mut buffer, byte_address).unwrap();
            assert_eq!(buffer, [0b10, 0]);
            assert_eq!(
                read_field(&entry, &buffer, byte_address),
                Ok(Some(FieldValue::Bool(true)))
            );
        }
        encode_value(&entry, FieldValue::Int(0), &mut buffer, byte_address).unwrap();
        assert_eq!(buffer, [0, 0]);
    }

    #[test]
    fn test_boolean_without_offset_uses_bit_zero() {
        let entry = FieldEntry {
            value_type: ValueType::Boolean,
            ..Default::default()
        };
        let byte_address = buffer_address("flag", Some(3), 0, entry.bit_offset()).unwrap() as usize;
        assert_eq!(byte_address, 7);
        let mut buffer = [0u8; 8];
        encode_value(&entry, FieldValue::Bool(true), &mut buffer, byte_address).unwrap();
        assert_eq!(buffer[7], 1);
        assert_eq!(
            read_field(&entry, &buffer, byte_address),
            Ok(Some(FieldValue::Bool(true)))
        );
    }

    #[test]
    fn test_packed_bytes_share_a_register() {
        let low = FieldEntry {
            offset: Some(0),
            ..integer(RegisterEncoding::UInt8)
        };
        let high = FieldEntry {
            offset: Some(8),
            register: Some(RegisterEncoding::Int8),
            ..Default::default()
        };
        let low_address = buffer_address("low", Some(0), 0, low.offset).unwrap() as usize;
        let high_address = buffer_address("high", Some(0), 0, high.offset).unwrap() as usize;

        let mut buffer = [0u8; 2];
        encode_value(&low, FieldValue::Int(200), &mut buffer, low_address).unwrap();
        encode_value(&high, FieldValue::Int(-2), &mut buffer, high_address).unwrap();
        assert_eq!(buffer, [0xFE, 200]);
        assert_eq!(
            read_field(&low, &buffer, low_address),
            Ok(Some(FieldValue::Int(200)))
        );
        assert_eq!(
            read_field(&high, &buffer, high_address),
            Ok(Some(FieldValue::Int(-2)))
        );
    }

    #[test]
    fn test_decode_value_callback() {
        let mut seen = Vec::new();
        let boolean = FieldEntry {
            value_type: ValueType::Boolean,
            offset: Some(3),
            ..Default::default()
        };
        decode_value(&boolean, RawValue::Number(0b1000), |v| seen.push(v));
        decode_value(&boolean, RawValue::Bool(false), |v| seen.push(v));

        let high = FieldEntry {
            offset: Some(8),
            ..Default::default()
        };
        decode_value(&high, RawValue::Number(0x1234), |v| seen.push(v));

        let float = FieldEntry {
            value_type: ValueType::Float,
            ..Default::default()
        };
        decode_value(&float, RawValue::Number(1), |v| seen.push(v));

        let unplaced = FieldEntry {
            value_type: ValueType::Boolean,
            ..Default::default()
        };
        decode_value(&unplaced, RawValue::Number(1), |v| seen.push(v));

        assert_eq!(
            seen,
            vec![
                FieldValue::Bool(true),
                FieldValue::Bool(false),
                FieldValue::Int(0x12)
            ]
        );
    }

    #[test]
    fn test_enum_encoding_not_implemented() {
        let entry = FieldEntry {
            value_type: ValueType::Enum,
            ..Default::default()
        };
        assert_eq!(
            encode_value(&entry, FieldValue::Int(1), &mut [0u8; 2], 0),
            Err(CodecError::NotImplemented {
                value_type: ValueType::Enum
            })
        );
    }

    #[test]
    fn test_validate_field_entry() {
        let ok = [
            FieldEntry {
                value_type: ValueType::Boolean,
                offset: Some(15),
                ..Default::default()
            },
            FieldEntry {
                offset: Some(8),
                ..Default::default()
            },
            FieldEntry {
                value_type: ValueType::String,
                offset: Some(0),
                register: Some(RegisterEncoding::Int8),
                ..Default::default()
            },
            integer(RegisterEncoding::UInt32BE),
        ];
        for entry in ok {
            assert_eq!(validate_field_entry(&entry), Ok(()), "{entry:?}");
        }

        let bad_offset = FieldEntry {
            offset: Some(4),
            ..Default::default()
        };
        assert!(matches!(
            validate_field_entry(&bad_offset),
            Err(CodecError::UnsupportedOffset { offset: 4, .. })
        ));

        let wide_with_offset = FieldEntry {
            offset: Some(8),
            ..integer(RegisterEncoding::UInt16BE)
        };
        assert!(matches!(
            validate_field_entry(&wide_with_offset),
            Err(CodecError::UnsupportedOffset { .. })
        ));

        let boolean_too_far = FieldEntry {
            value_type: ValueType::Boolean,
            offset: Some(16),
            ..Default::default()
        };
        assert_eq!(
            validate_field_entry(&boolean_too_far),
            Err(CodecError::InvalidOffset { offset: 16 })
        );

        let bad_default = FieldEntry {
            default: Some(serde_json::json!(40000)),
            ..integer(RegisterEncoding::Int16BE)
        };
        assert!(matches!(
            validate_field_entry(&bad_default),
            Err(CodecError::OutOfRange { value: 40000, .. })
        ));
    }
}
