/// Typed Modbus requests and responses
///
/// The engines speak in these enums; bytes are produced and parsed by
/// [`super::adu`]. Only the read-write function (0x17) is encoded here,
/// because `rmodbus` does not implement it.
use bytes::{Buf, BufMut, BytesMut};

use super::{ExceptionCode, FunctionCode};

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, states: Vec<bool> },
    /// `data` holds big-endian register bytes.
    WriteMultipleRegisters { address: u16, data: Vec<u8> },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil or discrete input states, trimmed to the requested quantity.
    Bits {
        function: FunctionCode,
        states: Vec<bool>,
    },
    /// Register bytes from a read or read-write request.
    Registers { function: FunctionCode, data: Vec<u8> },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultiple {
        function: FunctionCode,
        address: u16,
        quantity: u16,
    },
    Exception { function: u8, code: ExceptionCode },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        let code = match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::ReadWriteMultipleRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters,
        };
        code.into()
    }

    /// Builds a read request for `function`, `None` if it is not a read code.
    pub fn read(function: FunctionCode, address: u16, quantity: u16) -> Option<Self> {
        Some(match function {
            FunctionCode::ReadCoils => Self::ReadCoils { address, quantity },
            FunctionCode::ReadDiscreteInputs => Self::ReadDiscreteInputs { address, quantity },
            FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters { address, quantity },
            FunctionCode::ReadInputRegisters => Self::ReadInputRegisters { address, quantity },
            _ => return None,
        })
    }
}

impl Response {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Bits { function, .. }
            | Self::Registers { function, .. }
            | Self::WriteMultiple { function, .. } => (*function).into(),
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil.into(),
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.into(),
            Self::Exception { function, .. } => *function,
        }
    }

    pub fn exception(request: &Request, code: ExceptionCode) -> Self {
        Self::Exception {
            function: request.function_code(),
            code,
        }
    }

    /// The echo a device sends back for an accepted write.
    pub fn acknowledge(request: &Request) -> Option<Self> {
        Some(match request {
            Request::WriteSingleCoil { address, value } => Self::WriteSingleCoil {
                address: *address,
                value: *value,
            },
            Request::WriteSingleRegister { address, value } => Self::WriteSingleRegister {
                address: *address,
                value: *value,
            },
            Request::WriteMultipleCoils { address, states } => Self::WriteMultiple {
                function: FunctionCode::WriteMultipleCoils,
                address: *address,
                quantity: states.len() as u16,
            },
            Request::WriteMultipleRegisters { address, data } => Self::WriteMultiple {
                function: FunctionCode::WriteMultipleRegisters,
                address: *address,
                quantity: (data.len() / 2) as u16,
            },
            _ => return None,
        })
    }
}

/// Request PDU for function 0x17. Other requests yield an empty PDU.
pub fn encode_read_write(request: &Request) -> Vec<u8> {
    let Request::ReadWriteMultipleRegisters {
        read_address,
        read_quantity,
        write_address,
        data,
    } = request
    else {
        return Vec::new();
    };
    let mut buf = BytesMut::with_capacity(10 + data.len());
    buf.put_u8(FunctionCode::ReadWriteMultipleRegisters.into());
    buf.put_u16(*read_address);
    buf.put_u16(*read_quantity);
    buf.put_u16(*write_address);
    buf.put_u16((data.len() / 2) as u16);
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
    buf.to_vec()
}

/// Decodes a 0x17 request PDU.
///
/// Malformed bodies and out-of-limit quantities yield `IllegalDataValue`.
pub fn decode_read_write(pdu: &[u8]) -> Result<Request, ExceptionCode> {
    let invalid = ExceptionCode::IllegalDataValue;
    let mut body = pdu.get(1..).ok_or(invalid)?;
    if body.remaining() < 9 {
        return Err(invalid);
    }
    let read_address = body.get_u16();
    let read_quantity = body.get_u16();
    let write_address = body.get_u16();
    let write_quantity = body.get_u16();
    let count = usize::from(body.get_u8());
    if read_quantity == 0
        || read_quantity > MAX_READ_REGISTERS
        || write_quantity == 0
        || write_quantity > MAX_READ_WRITE_REGISTERS
        || count != usize::from(write_quantity) * 2
        || body.remaining() != count
    {
        return Err(invalid);
    }
    Ok(Request::ReadWriteMultipleRegisters {
        read_address,
        read_quantity,
        write_address,
        data: body.to_vec(),
    })
}

/// Response PDU for a served 0x17 request.
pub fn encode_read_write_response(outcome: &Result<Response, ExceptionCode>) -> Vec<u8> {
    let function = u8::from(FunctionCode::ReadWriteMultipleRegisters);
    let mut buf = BytesMut::with_capacity(2 + MAX_READ_REGISTERS as usize * 2);
    match outcome {
        Ok(Response::Registers { data, .. }) => {
            buf.put_u8(function);
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        Ok(_) => {
            buf.put_u8(function | 0x80);
            buf.put_u8(ExceptionCode::ServerDeviceFailure.into());
        }
        Err(code) => {
            buf.put_u8(function | 0x80);
            buf.put_u8((*code).into());
        }
    }
    buf.to_vec()
}

/// Decodes the answer to a 0x17 request.
pub fn decode_read_write_response(pdu: &[u8]) -> Option<Response> {
    let (&function, body) = pdu.split_first()?;
    if function & 0x80 != 0 {
        return Some(Response::Exception {
            function: function & 0x7F,
            code: ExceptionCode::try_from(*body.first()?).ok()?,
        });
    }
    let (&count, data) = body.split_first()?;
    if data.len() != usize::from(count) {
        return None;
    }
    Some(Response::Registers {
        function: FunctionCode::ReadWriteMultipleRegisters,
        data: data.to_vec(),
    })
}
