use derive_more::{Display, Error};

use super::{ExceptionCode, RegisterEncoding, ValueType};

/// Failures raised while converting between field values and register bytes.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum CodecError {
    #[display("invalid bit offset {offset}, expected a value in 0..=15")]
    InvalidOffset { offset: i64 },
    #[display("value {value} is out of range for {encoding} [{min}, {max}]")]
    OutOfRange {
        value: i64,
        encoding: RegisterEncoding,
        min: i64,
        max: i64,
    },
    #[display("value type {value_type} is not implemented")]
    NotImplemented { value_type: ValueType },
    #[display("offset {offset} cannot be combined with a {value_type} field encoded as {encoding}")]
    UnsupportedOffset {
        offset: i64,
        value_type: ValueType,
        encoding: RegisterEncoding,
    },
    #[display("radix {radix} is not supported, expected 2..=36")]
    InvalidRadix { radix: u32 },
    #[display("cannot interpret '{payload}' as a {value_type} value")]
    InvalidValue {
        payload: String,
        value_type: ValueType,
    },
    #[display("no address configured and no digits in key '{key}'")]
    MissingAddress { key: String },
    #[display("address {address} is outside the register space")]
    AddressOutOfRange { address: i64 },
}

/// Configuration problems. All of them abort startup.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ConfigError {
    #[display("Unexpected parameter: {name}")]
    UnexpectedParameter { name: String },
    #[display("invalid field key '{key}'")]
    InvalidFieldKey { key: String },
    #[display("Unit ID not implemented: {unit}")]
    UnitIdNotImplemented { unit: u64 },
    #[display("{key} is read in data but absent from writedata")]
    ReadBeforeWriteDataMissing { key: String },
    #[display("request type {request_type} is not available for {key}")]
    RequestTypeUnavailable { request_type: String, key: String },
    #[display("transaction {id} spans {quantity} items, above the limit of {limit}")]
    RequestTooLarge { id: String, quantity: u32, limit: u16 },
    #[display("field {key}/{property}: {source}")]
    Field {
        key: String,
        property: String,
        source: CodecError,
    },
    #[display("{_0}")]
    Codec(CodecError),
}

impl From<CodecError> for ConfigError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// Outcome of a master transaction that did not yield a usable response.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransactionError {
    #[display("device answered with exception {code}")]
    Exception { code: ExceptionCode },
    #[display("no response within the timeout")]
    Timeout,
    #[display("unexpected response function code {received:#04x}, expected {expected:#04x}")]
    UnexpectedResponseCode { expected: u8, received: u8 },
    #[display("transport failure: {message}")]
    Transport { message: String },
    #[display("connection closed")]
    Closed,
}

impl TransactionError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}
