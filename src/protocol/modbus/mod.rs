pub mod adu;
pub mod codec;
mod error;
mod field;
mod frame;
pub mod pdu;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use regex::Regex;
use std::{fmt, str::FromStr, sync::OnceLock};
use strum::{Display, EnumIter, EnumString};

pub use error::{CodecError, ConfigError, TransactionError};
pub use field::{FieldEntry, FieldMap, FieldValue, RawValue, RegisterEncoding, ValueType};
pub use adu::ClientFrame;
pub use frame::{rtu_crc_matches, rtu_request_len, FrameLen};
pub use pdu::{Request, Response};
pub use rmodbus::ModbusProto;

/// Unit id used when a field key carries no `#<n>` suffix.
pub const DEFAULT_UNIT_ID: u8 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display,
)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadWriteMultipleRegisters = 0x17,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display,
)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

/// The four Modbus data tables, named the way field keys name them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
pub enum RegisterClass {
    /// Discrete inputs, read-only bits
    #[strum(serialize = "DI")]
    DigitalInput,
    /// Coils, read-write bits
    #[strum(serialize = "DO")]
    DigitalOutput,
    /// Input registers, read-only words
    #[strum(serialize = "AI")]
    AnalogInput,
    /// Holding registers, read-write words
    #[strum(serialize = "AO")]
    AnalogOutput,
}

impl RegisterClass {
    pub fn is_bit(self) -> bool {
        matches!(self, Self::DigitalInput | Self::DigitalOutput)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::DigitalOutput | Self::AnalogOutput)
    }

    /// Table a function code reads or writes.
    pub fn of_function(function: u8) -> Option<Self> {
        Some(match FunctionCode::try_from(function).ok()? {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => Self::DigitalOutput,
            FunctionCode::ReadDiscreteInputs => Self::DigitalInput,
            FunctionCode::ReadInputRegisters => Self::AnalogInput,
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters
            | FunctionCode::ReadWriteMultipleRegisters => Self::AnalogOutput,
        })
    }

    pub fn read_code(self) -> FunctionCode {
        match self {
            Self::DigitalInput => FunctionCode::ReadDiscreteInputs,
            Self::DigitalOutput => FunctionCode::ReadCoils,
            Self::AnalogInput => FunctionCode::ReadInputRegisters,
            Self::AnalogOutput => FunctionCode::ReadHoldingRegisters,
        }
    }

    /// Single and multiple write codes, `None` for the read-only tables.
    pub fn write_codes(self) -> Option<(FunctionCode, FunctionCode)> {
        match self {
            Self::DigitalOutput => Some((
                FunctionCode::WriteSingleCoil,
                FunctionCode::WriteMultipleCoils,
            )),
            Self::AnalogOutput => Some((
                FunctionCode::WriteSingleRegister,
                FunctionCode::WriteMultipleRegisters,
            )),
            _ => None,
        }
    }

    /// Largest quantity a single read of this table may request.
    pub fn max_read_quantity(self) -> u16 {
        if self.is_bit() {
            pdu::MAX_READ_BITS
        } else {
            pdu::MAX_READ_REGISTERS
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::DigitalInput => "Digital Inputs",
            Self::DigitalOutput => "Coils",
            Self::AnalogInput => "Input Register",
            Self::AnalogOutput => "Holding Register",
        }
    }
}

/// A parsed `<RegisterClass>[#<unit>]` key such as `AO` or `DI#3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub class: RegisterClass,
    pub unit: Option<u8>,
}

fn field_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(DI|DO|AI|AO)(?:#([0-9]+))?$").unwrap_or_else(|err| {
            unreachable!("field key pattern is a valid regex: {err}")
        })
    })
}

impl FieldKey {
    pub fn unit_or(&self, default_unit: u8) -> u8 {
        self.unit.unwrap_or(default_unit)
    }

    /// Node id derived from the key, `#` is not allowed in topic levels.
    pub fn node_id(&self) -> String {
        self.to_string().replace('#', "-")
    }
}

impl FromStr for FieldKey {
    type Err = ConfigError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidFieldKey {
            key: key.to_string(),
        };
        let captures = field_key_pattern().captures(key).ok_or_else(invalid)?;
        let class = captures
            .get(1)
            .and_then(|m| RegisterClass::from_str(m.as_str()).ok())
            .ok_or_else(invalid)?;
        let unit = match captures.get(2) {
            None => None,
            Some(digits) => {
                let unit = digits
                    .as_str()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::UnitIdNotImplemented { unit: u64::MAX })?;
                let unit = u8::try_from(unit)
                    .map_err(|_| ConfigError::UnitIdNotImplemented { unit })?;
                Some(unit)
            }
        };
        Ok(Self { class, unit })
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}#{unit}", self.class),
            None => write!(f, "{}", self.class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_keys() {
        let key: FieldKey = "AO".parse().unwrap();
        assert_eq!(key.class, RegisterClass::AnalogOutput);
        assert_eq!(key.unit, None);
        assert_eq!(key.unit_or(DEFAULT_UNIT_ID), 1);

        let key: FieldKey = "DI#12".parse().unwrap();
        assert_eq!(key.class, RegisterClass::DigitalInput);
        assert_eq!(key.unit, Some(12));
        assert_eq!(key.node_id(), "DI-12");
        assert_eq!(key.to_string(), "DI#12");
    }

    #[test]
    fn test_unit_above_255_is_rejected() {
        assert_eq!(
            "AI#256".parse::<FieldKey>(),
            Err(ConfigError::UnitIdNotImplemented { unit: 256 })
        );
        assert!("AI#255".parse::<FieldKey>().is_ok());
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        for key in ["", "XX", "AO#", "ao", "AO#1#2", "DO 1"] {
            assert!(
                matches!(
                    key.parse::<FieldKey>(),
                    Err(ConfigError::InvalidFieldKey { .. })
                ),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn test_register_class_codes() {
        assert_eq!(
            RegisterClass::DigitalOutput.read_code(),
            FunctionCode::ReadCoils
        );
        assert_eq!(RegisterClass::AnalogInput.write_codes(), None);
        assert_eq!(
            u8::from(FunctionCode::ReadWriteMultipleRegisters),
            0x17
        );
        assert_eq!(
            ExceptionCode::try_from(0x02u8).ok(),
            Some(ExceptionCode::IllegalDataAddress)
        );
    }
}
