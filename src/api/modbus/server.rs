/// Serving Modbus frames from the slave store
///
/// Standard function codes are parsed, range-checked and answered by
/// `rmodbus::server::ModbusFrame`; the store only fills reads and applies
/// writes through the external read/write hooks, so every written address
/// still emits its change notification. Function 0x17 is unknown to
/// `rmodbus` and goes through [`SlaveStore::handle_request`].
use rmodbus::{
    server::{ModbusFrame, Read, Write},
    ErrorKind, ModbusProto,
};

use super::slave::{SlaveStore, SpaceData};
use crate::protocol::modbus::{
    adu, pdu, ExceptionCode, FunctionCode, RegisterClass,
};

/// What serving one frame produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    /// Bytes to send back; `exception` marks an exception reply.
    Reply { frame: Vec<u8>, exception: bool },
    /// Broadcast, nothing goes back.
    Silent,
    /// Checksum or length errors; the frame is dropped.
    Malformed(String),
}

fn is_broadcast(unit: u8) -> bool {
    unit == 0 || unit == 255
}

fn malformed(err: impl std::fmt::Debug) -> Served {
    Served::Malformed(format!("{err:?}"))
}

/// A TCP/UDP frame shorter than its function needs would make `rmodbus`
/// index past the end, since only serial frames are length-checked there.
fn truncated(proto: ModbusProto, frame: &[u8]) -> bool {
    let start = adu::frame_start(proto);
    let Some(&function) = frame.get(start + 1) else {
        return true;
    };
    match function {
        0x01..=0x06 => frame.len() < start + 6,
        0x0F | 0x10 => match frame.get(start + 6) {
            Some(count) => frame.len() < start + 7 + usize::from(*count),
            None => true,
        },
        _ => false,
    }
}

fn unpack_bits(packed: &[u8], count: u16) -> Vec<bool> {
    (0..usize::from(count))
        .map(|index| packed.get(index / 8).is_some_and(|byte| byte & (1 << (index % 8)) != 0))
        .collect()
}

fn fill(data: SpaceData, buf: &mut [u8]) -> Result<(), ErrorKind> {
    match data {
        SpaceData::Bits(states) => {
            for (index, _) in states.iter().enumerate().filter(|(_, state)| **state) {
                if let Some(byte) = buf.get_mut(index / 8) {
                    *byte |= 1 << (index % 8);
                }
            }
        }
        SpaceData::Bytes(bytes) => {
            let target = buf
                .get_mut(..bytes.len())
                .ok_or(ErrorKind::IllegalDataAddress)?;
            target.copy_from_slice(&bytes);
        }
    }
    Ok(())
}

impl SlaveStore {
    /// Serves one binary frame (ASCII lines are decoded by the transport).
    pub fn serve_frame(&mut self, proto: ModbusProto, frame: &[u8]) -> Served {
        let start = adu::frame_start(proto);
        let (Some(&unit), Some(&function)) = (frame.get(start), frame.get(start + 1)) else {
            return Served::Malformed(format!("frame too short: {frame:02X?}"));
        };
        if function == u8::from(FunctionCode::ReadWriteMultipleRegisters) {
            return self.serve_read_write(proto, frame);
        }
        if proto == ModbusProto::TcpUdp && truncated(proto, frame) {
            return Served::Malformed(format!("truncated frame {frame:02X?}"));
        }

        let mut response = Vec::new();
        let mut request = ModbusFrame::new(unit, frame, proto, &mut response);
        if let Err(err) = request.parse() {
            return malformed(err);
        }
        if !is_broadcast(unit) && !self.has_unit(unit) {
            request.error = None;
            request.processing_required = false;
            if let Err(err) = request.set_modbus_error_if_unset(&ErrorKind::IllegalDataAddress) {
                return malformed(err);
            }
        }
        if request.processing_required {
            let class = RegisterClass::of_function(request.responding_to_fn);
            let processed = match class {
                Some(class) if request.readonly => self.external_read(&mut request, unit, class),
                Some(class) => self.external_write(&mut request, unit, class),
                None => request.set_modbus_error_if_unset(&ErrorKind::IllegalFunction),
            };
            if let Err(err) = processed {
                return malformed(err);
            }
        }
        if !request.response_required {
            return Served::Silent;
        }
        let exception = request.error.is_some();
        if let Err(err) = request.finalize_response() {
            return malformed(err);
        }
        Served::Reply {
            frame: response,
            exception,
        }
    }

    fn external_read(
        &self,
        request: &mut ModbusFrame<'_, Vec<u8>>,
        unit: u8,
        class: RegisterClass,
    ) -> Result<(), ErrorKind> {
        let result = match request.get_external_read()? {
            Read::Bits(read) => self
                .read_space(unit, class, read.address, read.count)
                .map_err(adu::modbus_error)
                .and_then(|data| fill(data, read.buf)),
            Read::Words(read) => self
                .read_space(unit, class, read.address, read.count)
                .map_err(adu::modbus_error)
                .and_then(|data| fill(data, read.buf)),
        };
        request.process_external_read(result)
    }

    fn external_write(
        &mut self,
        request: &mut ModbusFrame<'_, Vec<u8>>,
        unit: u8,
        class: RegisterClass,
    ) -> Result<(), ErrorKind> {
        let units = if is_broadcast(unit) {
            self.unit_ids()
        } else {
            vec![unit]
        };
        let result = match request.get_external_write() {
            Ok(Write::Bits(write)) => {
                if write.count == 0 || write.data.len() != usize::from(write.count).div_ceil(8) {
                    Err(ErrorKind::IllegalDataValue)
                } else {
                    let data = SpaceData::Bits(unpack_bits(write.data, write.count));
                    self.write_units(&units, class, write.address, &data)
                }
            }
            Ok(Write::Words(write)) => {
                if write.count == 0 || write.data.len() != usize::from(write.count) * 2 {
                    Err(ErrorKind::IllegalDataValue)
                } else {
                    let data = SpaceData::Bytes(write.data.to_vec());
                    self.write_units(&units, class, write.address, &data)
                }
            }
            Err(err) => Err(err),
        };
        request.process_external_write(result)
    }

    fn write_units(
        &mut self,
        units: &[u8],
        class: RegisterClass,
        address: u16,
        data: &SpaceData,
    ) -> Result<(), ErrorKind> {
        for unit in units {
            self.write_space(*unit, class, address, data)
                .map_err(adu::modbus_error)?;
        }
        Ok(())
    }

    fn serve_read_write(&mut self, proto: ModbusProto, frame: &[u8]) -> Served {
        let request = match adu::split(proto, frame) {
            Ok(request) => request,
            Err(err) => return Served::Malformed(err.to_string()),
        };
        if is_broadcast(request.unit) {
            return Served::Silent;
        }
        let outcome = pdu::decode_read_write(request.pdu)
            .and_then(|decoded| self.handle_request(request.unit, &decoded));
        let exception: Option<ExceptionCode> = outcome.as_ref().err().copied();
        let reply = pdu::encode_read_write_response(&outcome);
        Served::Reply {
            frame: adu::wrap(proto, request.transaction_id, request.unit, &reply),
            exception: exception.is_some(),
        }
    }
}
