/// Modbus application data units
///
/// Requests are generated and responses parsed with `rmodbus`, for TCP/UDP
/// (MBAP), RTU (CRC) and ASCII (LRC) alike. Function 0x17 has no support in
/// `rmodbus`, so its frames are wrapped and checked here.
use anyhow::{anyhow, ensure, Result};
use rmodbus::{
    calc_crc16, calc_lrc, client::ModbusRequest, generate_ascii_frame, guess_response_frame_len,
    parse_ascii_frame, ErrorKind, ModbusProto,
};

use super::{pdu, ExceptionCode, FunctionCode, Request, Response, TransactionError};

/// Transaction id, protocol id and length in front of the unit id.
pub const MBAP_PREFIX_LEN: usize = 6;
/// Largest ADU on any framing: MBAP prefix, unit id and a 253 byte PDU.
pub const MAX_ADU_LEN: usize = MBAP_PREFIX_LEN + 1 + 253;

/// Offset of the unit id inside a frame.
pub fn frame_start(proto: ModbusProto) -> usize {
    match proto {
        ModbusProto::TcpUdp => MBAP_PREFIX_LEN,
        ModbusProto::Rtu | ModbusProto::Ascii => 0,
    }
}

/// Total frame length announced by an MBAP prefix.
///
/// `guess_response_frame_len` reports lengths as `u8`, which cannot carry
/// the 259 byte answer to a 125 register read, so the prefix is read here.
pub fn mbap_frame_len(prefix: &[u8]) -> Result<usize> {
    ensure!(
        prefix.len() >= MBAP_PREFIX_LEN,
        "MBAP prefix needs {MBAP_PREFIX_LEN} bytes, got {}",
        prefix.len()
    );
    let protocol = u16::from_be_bytes([prefix[2], prefix[3]]);
    let length = usize::from(u16::from_be_bytes([prefix[4], prefix[5]]));
    ensure!(protocol == 0, "Unsupported MBAP protocol id {protocol}");
    ensure!((2..=254).contains(&length), "Invalid MBAP length {length}");
    Ok(MBAP_PREFIX_LEN + length)
}

pub fn transaction_id(frame: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*frame.first()?, *frame.get(1)?]))
}

/// Length of a serial response frame, from its first three bytes.
pub fn serial_response_len(head: &[u8], proto: ModbusProto) -> Result<usize> {
    ensure!(head.len() >= 3, "response head needs 3 bytes");
    if head[1] == u8::from(FunctionCode::ReadWriteMultipleRegisters) {
        let checksum = if proto == ModbusProto::Rtu { 2 } else { 1 };
        return Ok(3 + usize::from(head[2]) + checksum);
    }
    guess_response_frame_len(head, proto)
        .map(usize::from)
        .map_err(|err| anyhow!("Cannot size response {head:02X?}: {err:?}"))
}

/// Hex-encodes a binary ASCII-mode frame into `:...\r\n`.
pub fn encode_ascii(frame: &[u8]) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(frame.len() * 2 + 3);
    generate_ascii_frame(frame, &mut line).map_err(|err| anyhow!("ASCII encoding: {err:?}"))?;
    Ok(line)
}

/// Decodes one `:...\r\n` line back into its binary frame.
pub fn decode_ascii(line: &[u8]) -> Result<Vec<u8>> {
    let hex: Vec<u8> = line
        .iter()
        .copied()
        .filter(|byte| !matches!(byte, b':' | b'\r' | b'\n'))
        .collect();
    ensure!(
        !hex.is_empty() && hex.len() % 2 == 0 && hex.len() <= 2 * 255,
        "Malformed ASCII frame {:?}",
        String::from_utf8_lossy(line)
    );
    let mut frame = [0u8; 256];
    let len = parse_ascii_frame(&hex, hex.len(), &mut frame, 0)
        .map_err(|err| anyhow!("Malformed ASCII frame: {err:?}"))?;
    Ok(frame[..usize::from(len)].to_vec())
}

/// Unit id and PDU of a checked frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adu<'a> {
    pub transaction_id: u16,
    pub unit: u8,
    pub pdu: &'a [u8],
}

/// Checks framing (MBAP length, CRC or LRC) and splits off the PDU.
pub fn split(proto: ModbusProto, frame: &[u8]) -> Result<Adu<'_>> {
    match proto {
        ModbusProto::TcpUdp => {
            let len = mbap_frame_len(frame)?;
            ensure!(frame.len() == len, "MBAP frame of {} bytes, expected {len}", frame.len());
            Ok(Adu {
                transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
                unit: frame[MBAP_PREFIX_LEN],
                pdu: &frame[MBAP_PREFIX_LEN + 1..],
            })
        }
        ModbusProto::Rtu => {
            ensure!((4..=256).contains(&frame.len()), "RTU frame of {} bytes", frame.len());
            let (body, crc) = frame.split_at(frame.len() - 2);
            let expected = calc_crc16(body, body.len() as u8);
            let received = u16::from_le_bytes([crc[0], crc[1]]);
            ensure!(
                expected == received,
                "CRC mismatch: expected {expected:#06x}, received {received:#06x}"
            );
            Ok(Adu {
                transaction_id: 0,
                unit: body[0],
                pdu: &body[1..],
            })
        }
        ModbusProto::Ascii => {
            ensure!((3..=256).contains(&frame.len()), "ASCII frame of {} bytes", frame.len());
            let (body, lrc) = frame.split_at(frame.len() - 1);
            let expected = calc_lrc(body, body.len() as u8);
            ensure!(expected == lrc[0], "LRC mismatch: expected {expected:#04x}, received {:#04x}", lrc[0]);
            Ok(Adu {
                transaction_id: 0,
                unit: body[0],
                pdu: &body[1..],
            })
        }
    }
}

/// Frames a PDU the way `rmodbus` frames the ones it generates.
pub fn wrap(proto: ModbusProto, transaction_id: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + MBAP_PREFIX_LEN + 3);
    if proto == ModbusProto::TcpUdp {
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    }
    frame.push(unit);
    frame.extend_from_slice(pdu);
    match proto {
        ModbusProto::Rtu => {
            let crc = calc_crc16(&frame, frame.len() as u8);
            frame.extend_from_slice(&crc.to_le_bytes());
        }
        ModbusProto::Ascii => {
            let lrc = calc_lrc(&frame, frame.len() as u8);
            frame.push(lrc);
        }
        ModbusProto::TcpUdp => {}
    }
    frame
}

/// Exception code carried by an `rmodbus` error, if it is a Modbus one.
pub fn exception_code(err: &ErrorKind) -> Option<ExceptionCode> {
    if !err.is_modbus_error() {
        return None;
    }
    let code = err.to_modbus_error().ok()?;
    ExceptionCode::try_from(code.byte()).ok()
}

/// The `rmodbus` error a store exception maps to.
pub fn modbus_error(code: ExceptionCode) -> ErrorKind {
    match code {
        ExceptionCode::IllegalFunction => ErrorKind::IllegalFunction,
        ExceptionCode::IllegalDataValue => ErrorKind::IllegalDataValue,
        _ => ErrorKind::IllegalDataAddress,
    }
}

/// One master request, framed and ready to send, plus what is needed to
/// parse its answer.
pub struct ClientFrame {
    request: Request,
    proto: ModbusProto,
    unit: u8,
    /// `None` for function codes framed by hand.
    exchange: Option<ModbusRequest>,
    bytes: Vec<u8>,
}

impl ClientFrame {
    pub fn new(
        proto: ModbusProto,
        unit: u8,
        transaction_id: u16,
        request: &Request,
    ) -> Result<Self, TransactionError> {
        let mut exchange = ModbusRequest::new(unit, proto);
        exchange.tr_id = transaction_id;
        let mut bytes = Vec::new();
        let generated = match request {
            Request::ReadCoils { address, quantity } => {
                exchange.generate_get_coils(*address, *quantity, &mut bytes)
            }
            Request::ReadDiscreteInputs { address, quantity } => {
                exchange.generate_get_discretes(*address, *quantity, &mut bytes)
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                exchange.generate_get_holdings(*address, *quantity, &mut bytes)
            }
            Request::ReadInputRegisters { address, quantity } => {
                exchange.generate_get_inputs(*address, *quantity, &mut bytes)
            }
            Request::WriteSingleCoil { address, value } => {
                exchange.generate_set_coil(*address, *value, &mut bytes)
            }
            Request::WriteSingleRegister { address, value } => {
                exchange.generate_set_holding(*address, *value, &mut bytes)
            }
            Request::WriteMultipleCoils { address, states } => {
                exchange.generate_set_coils_bulk(*address, states, &mut bytes)
            }
            Request::WriteMultipleRegisters { address, data } => {
                let words: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|word| u16::from_be_bytes([word[0], word[1]]))
                    .collect();
                exchange.generate_set_holdings_bulk(*address, &words, &mut bytes)
            }
            Request::ReadWriteMultipleRegisters { .. } => {
                return Ok(Self {
                    request: request.clone(),
                    proto,
                    unit,
                    exchange: None,
                    bytes: wrap(proto, transaction_id, unit, &pdu::encode_read_write(request)),
                });
            }
        };
        generated.map_err(|err| {
            TransactionError::transport(format!("cannot build {request:?}: {err:?}"))
        })?;
        Ok(Self {
            request: request.clone(),
            proto,
            unit,
            exchange: Some(exchange),
            bytes,
        })
    }

    /// Binary frame; ASCII lines are produced by [`encode_ascii`].
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Parses the answer. Exception replies come back as
    /// [`Response::Exception`]; framing faults as transport errors.
    pub fn parse(&self, frame: &[u8]) -> Result<Response, TransactionError> {
        let start = frame_start(self.proto);
        let expected = self.request.function_code();
        let received = *frame
            .get(start + 1)
            .ok_or_else(|| TransactionError::transport(format!("short response {frame:02X?}")))?;
        if received & 0x7F != expected {
            return Err(TransactionError::UnexpectedResponseCode { expected, received });
        }
        match &self.exchange {
            Some(exchange) => self.parse_with(exchange, frame),
            None => self.parse_read_write(frame),
        }
    }

    fn parse_with(&self, exchange: &ModbusRequest, frame: &[u8]) -> Result<Response, TransactionError> {
        let function = self.request.function_code();
        let failed = |err: ErrorKind| match exception_code(&err) {
            Some(code) => Ok(Response::Exception { function, code }),
            None => Err(TransactionError::transport(format!(
                "malformed response {frame:02X?}: {err:?}"
            ))),
        };
        let response = match &self.request {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                let mut states: Vec<bool> = Vec::new();
                if let Err(err) = exchange.parse_bool(frame, &mut states) {
                    return failed(err);
                }
                states.truncate(usize::from(*quantity));
                Response::Bits {
                    function: FunctionCode::try_from(function)
                        .map_err(TransactionError::transport)?,
                    states,
                }
            }
            Request::ReadHoldingRegisters { .. } | Request::ReadInputRegisters { .. } => {
                let mut words: Vec<u16> = Vec::new();
                if let Err(err) = exchange.parse_u16(frame, &mut words) {
                    return failed(err);
                }
                Response::Registers {
                    function: FunctionCode::try_from(function)
                        .map_err(TransactionError::transport)?,
                    data: words.iter().flat_map(|word| word.to_be_bytes()).collect(),
                }
            }
            request => {
                if let Err(err) = exchange.parse_ok(frame) {
                    return failed(err);
                }
                Response::acknowledge(request).ok_or_else(|| {
                    TransactionError::transport(format!("no acknowledgement for {request:?}"))
                })?
            }
        };
        Ok(response)
    }

    fn parse_read_write(&self, frame: &[u8]) -> Result<Response, TransactionError> {
        let adu = split(self.proto, frame).map_err(TransactionError::transport)?;
        if adu.unit != self.unit {
            return Err(TransactionError::transport(format!(
                "reply from unit {}, expected {}",
                adu.unit, self.unit
            )));
        }
        pdu::decode_read_write_response(adu.pdu).ok_or_else(|| {
            TransactionError::transport(format!("malformed response {frame:02X?}"))
        })
    }
}
