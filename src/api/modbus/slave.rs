/// Slave register store and request handler
///
/// Every unit owns four register spaces. Bit spaces (coils, discrete inputs)
/// hold one `bool` per address; word spaces (holding and input registers)
/// hold big-endian register bytes. Writes coming from Modbus requests emit a
/// change notification per touched bit or register.
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    core::stats::Stats,
    protocol::modbus::{
        codec::{self, checked_register},
        CodecError, ConfigError, ExceptionCode, FieldEntry, FieldKey, FieldMap, FieldValue,
        FunctionCode, ModbusProto, RawValue, RegisterClass, Request, Response, ValueType,
    },
};

use super::server::Served;

/// Addresses per bit space.
pub const BIT_SPACE_LEN: usize = 0x10000;
/// Registers per word space.
pub const REGISTER_SPACE_LEN: usize = 0x10000;
/// Change notifications are keyed by address modulo this value.
pub const CHANGE_KEY_MODULUS: usize = 10000;

/// Contents read from or written to a register space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceData {
    Bits(Vec<bool>),
    Bytes(Vec<u8>),
}

/// Value carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValue {
    Bit(bool),
    Word(u16),
}

/// Observer list keyed by address.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    observers: HashMap<u16, Vec<flume::Sender<CellValue>>>,
}

impl ChangeNotifier {
    pub fn subscribe(&mut self, address: u16) -> flume::Receiver<CellValue> {
        let (tx, rx) = flume::unbounded();
        self.observers.entry(address).or_default().push(tx);
        rx
    }

    pub fn emit(&mut self, address: usize, value: CellValue) {
        let key = (address % CHANGE_KEY_MODULUS) as u16;
        if let Some(observers) = self.observers.get_mut(&key) {
            observers.retain(|tx| tx.send(value).is_ok());
        }
    }
}

/// One addressable table of a unit.
#[derive(Debug)]
pub enum RegisterSpace {
    Bits {
        states: Vec<bool>,
        notifier: ChangeNotifier,
    },
    Words {
        bytes: Vec<u8>,
        notifier: ChangeNotifier,
    },
}

impl RegisterSpace {
    pub fn bits(len: usize) -> Self {
        Self::Bits {
            states: vec![false; len],
            notifier: ChangeNotifier::default(),
        }
    }

    pub fn words(len: usize) -> Self {
        Self::Words {
            bytes: vec![0; len * 2],
            notifier: ChangeNotifier::default(),
        }
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        match self {
            Self::Bits { states, .. } => states.len(),
            Self::Words { bytes, .. } => bytes.len() / 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, address: u16, quantity: usize) -> Result<std::ops::Range<usize>, ExceptionCode> {
        let start = usize::from(address);
        let end = start + quantity;
        if quantity == 0 || end > self.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }

    /// Bit states or register bytes for `quantity` addresses.
    pub fn read_at(&self, address: u16, quantity: u16) -> Result<SpaceData, ExceptionCode> {
        let range = self.range(address, usize::from(quantity))?;
        Ok(match self {
            Self::Bits { states, .. } => SpaceData::Bits(states[range].to_vec()),
            Self::Words { bytes, .. } => {
                SpaceData::Bytes(bytes[range.start * 2..range.end * 2].to_vec())
            }
        })
    }

    /// Writes and notifies every touched address. Nothing is written when
    /// the range check fails.
    pub fn write_at(&mut self, address: u16, data: &SpaceData) -> Result<(), ExceptionCode> {
        match (self, data) {
            (Self::Bits { states, notifier }, SpaceData::Bits(values)) => {
                let start = usize::from(address);
                if values.is_empty() || start + values.len() > states.len() {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                for (index, value) in values.iter().enumerate() {
                    states[start + index] = *value;
                    notifier.emit(start + index, CellValue::Bit(*value));
                }
                Ok(())
            }
            (Self::Words { bytes, notifier }, SpaceData::Bytes(values)) => {
                let start = usize::from(address);
                if values.is_empty() || values.len() % 2 != 0 || start * 2 + values.len() > bytes.len() {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                bytes[start * 2..start * 2 + values.len()].copy_from_slice(values);
                for (index, word) in values.chunks_exact(2).enumerate() {
                    notifier.emit(
                        start + index,
                        CellValue::Word(u16::from_be_bytes([word[0], word[1]])),
                    );
                }
                Ok(())
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    pub fn subscribe(&mut self, address: u16) -> flume::Receiver<CellValue> {
        match self {
            Self::Bits { notifier, .. } | Self::Words { notifier, .. } => {
                notifier.subscribe(address)
            }
        }
    }

    pub fn peek(&self, address: u16) -> Option<CellValue> {
        let index = usize::from(address);
        match self {
            Self::Bits { states, .. } => states.get(index).copied().map(CellValue::Bit),
            Self::Words { bytes, .. } => bytes
                .get(index * 2..index * 2 + 2)
                .map(|word| CellValue::Word(u16::from_be_bytes([word[0], word[1]]))),
        }
    }

    /// Emits the current value of `address` to its observers.
    pub fn notify(&mut self, address: u16) {
        if let Some(value) = self.peek(address) {
            match self {
                Self::Bits { notifier, .. } | Self::Words { notifier, .. } => {
                    notifier.emit(usize::from(address), value)
                }
            }
        }
    }

    pub fn states_mut(&mut self) -> Option<&mut [bool]> {
        match self {
            Self::Bits { states, .. } => Some(states),
            Self::Words { .. } => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Words { bytes, .. } => Some(bytes),
            Self::Bits { .. } => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Words { bytes, .. } => Some(bytes),
            Self::Bits { .. } => None,
        }
    }
}

/// The four tables of one unit id.
#[derive(Debug)]
pub struct UnitRegisters {
    pub coils: RegisterSpace,
    pub discrete_inputs: RegisterSpace,
    pub holding_registers: RegisterSpace,
    pub input_registers: RegisterSpace,
}

impl Default for UnitRegisters {
    fn default() -> Self {
        Self {
            coils: RegisterSpace::bits(BIT_SPACE_LEN),
            discrete_inputs: RegisterSpace::bits(BIT_SPACE_LEN),
            holding_registers: RegisterSpace::words(REGISTER_SPACE_LEN),
            input_registers: RegisterSpace::words(REGISTER_SPACE_LEN),
        }
    }
}

impl UnitRegisters {
    pub fn space(&self, class: RegisterClass) -> &RegisterSpace {
        match class {
            RegisterClass::DigitalInput => &self.discrete_inputs,
            RegisterClass::DigitalOutput => &self.coils,
            RegisterClass::AnalogInput => &self.input_registers,
            RegisterClass::AnalogOutput => &self.holding_registers,
        }
    }

    pub fn space_mut(&mut self, class: RegisterClass) -> &mut RegisterSpace {
        match class {
            RegisterClass::DigitalInput => &mut self.discrete_inputs,
            RegisterClass::DigitalOutput => &mut self.coils,
            RegisterClass::AnalogInput => &mut self.input_registers,
            RegisterClass::AnalogOutput => &mut self.holding_registers,
        }
    }
}

/// Register state of every simulated unit.
#[derive(Debug, Default)]
pub struct SlaveStore {
    units: HashMap<u8, UnitRegisters>,
}

impl SlaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unit, creating it on first reference.
    pub fn unit(&mut self, unit_id: u8) -> &mut UnitRegisters {
        self.units.entry(unit_id).or_default()
    }

    pub fn get_unit(&self, unit_id: u8) -> Option<&UnitRegisters> {
        self.units.get(&unit_id)
    }

    pub fn has_unit(&self, unit_id: u8) -> bool {
        self.units.contains_key(&unit_id)
    }

    /// Serves one request against the store.
    pub fn handle_request(&mut self, unit_id: u8, request: &Request) -> Result<Response, ExceptionCode> {
        let unit = self
            .units
            .get_mut(&unit_id)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        match request {
            Request::ReadCoils { address, quantity } => read_bits(&unit.coils, FunctionCode::ReadCoils, *address, *quantity),
            Request::ReadDiscreteInputs { address, quantity } => read_bits(
                &unit.discrete_inputs,
                FunctionCode::ReadDiscreteInputs,
                *address,
                *quantity,
            ),
            Request::ReadHoldingRegisters { address, quantity } => read_words(
                &unit.holding_registers,
                FunctionCode::ReadHoldingRegisters,
                *address,
                *quantity,
            ),
            Request::ReadInputRegisters { address, quantity } => read_words(
                &unit.input_registers,
                FunctionCode::ReadInputRegisters,
                *address,
                *quantity,
            ),
            Request::WriteSingleCoil { address, value } => {
                unit.coils
                    .write_at(*address, &SpaceData::Bits(vec![*value]))?;
                Ok(Response::WriteSingleCoil {
                    address: *address,
                    value: *value,
                })
            }
            Request::WriteSingleRegister { address, value } => {
                unit.holding_registers
                    .write_at(*address, &SpaceData::Bytes(value.to_be_bytes().to_vec()))?;
                Ok(Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                })
            }
            Request::WriteMultipleCoils { address, states } => {
                unit.coils.write_at(*address, &SpaceData::Bits(states.clone()))?;
                Ok(Response::WriteMultiple {
                    function: FunctionCode::WriteMultipleCoils,
                    address: *address,
                    quantity: states.len() as u16,
                })
            }
            Request::WriteMultipleRegisters { address, data } => {
                unit.holding_registers
                    .write_at(*address, &SpaceData::Bytes(data.clone()))?;
                Ok(Response::WriteMultiple {
                    function: FunctionCode::WriteMultipleRegisters,
                    address: *address,
                    quantity: (data.len() / 2) as u16,
                })
            }
            Request::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                data,
            } => {
                unit.holding_registers
                    .write_at(*write_address, &SpaceData::Bytes(data.clone()))
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                read_words(
                    &unit.holding_registers,
                    FunctionCode::ReadWriteMultipleRegisters,
                    *read_address,
                    *read_quantity,
                )
            }
        }
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.units.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Reads `quantity` addresses of one table. A zero quantity is an
    /// illegal value, a range past the table an illegal address.
    pub fn read_space(
        &self,
        unit_id: u8,
        class: RegisterClass,
        address: u16,
        quantity: u16,
    ) -> Result<SpaceData, ExceptionCode> {
        if quantity == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.units
            .get(&unit_id)
            .ok_or(ExceptionCode::IllegalDataAddress)?
            .space(class)
            .read_at(address, quantity)
    }

    /// Writes one table of a unit, notifying every touched address.
    pub fn write_space(
        &mut self,
        unit_id: u8,
        class: RegisterClass,
        address: u16,
        data: &SpaceData,
    ) -> Result<(), ExceptionCode> {
        self.units
            .get_mut(&unit_id)
            .ok_or(ExceptionCode::IllegalDataAddress)?
            .space_mut(class)
            .write_at(address, data)
    }
}

fn read_bits(
    space: &RegisterSpace,
    function: FunctionCode,
    address: u16,
    quantity: u16,
) -> Result<Response, ExceptionCode> {
    match space.read_at(address, quantity)? {
        SpaceData::Bits(states) => Ok(Response::Bits { function, states }),
        SpaceData::Bytes(_) => Err(ExceptionCode::ServerDeviceFailure),
    }
}

fn read_words(
    space: &RegisterSpace,
    function: FunctionCode,
    address: u16,
    quantity: u16,
) -> Result<Response, ExceptionCode> {
    match space.read_at(address, quantity)? {
        SpaceData::Bytes(data) => Ok(Response::Registers { function, data }),
        SpaceData::Bits(_) => Err(ExceptionCode::ServerDeviceFailure),
    }
}

/// Shared store plus the per-listener response policy.
pub struct SlaveService {
    store: Arc<Mutex<SlaveStore>>,
    delay: Option<Duration>,
    stats: Arc<Stats>,
    max_buffer_overflows: Option<u32>,
}

impl SlaveService {
    pub fn new(store: Arc<Mutex<SlaveStore>>, delay: Option<Duration>, stats: Arc<Stats>) -> Self {
        Self {
            store,
            delay,
            stats,
            max_buffer_overflows: None,
        }
    }

    /// Limits how many malformed headers one TCP client IP may send.
    pub fn with_max_buffer_overflows(mut self, limit: Option<u32>) -> Self {
        self.max_buffer_overflows = limit;
        self
    }

    pub fn max_buffer_overflows(&self) -> Option<u32> {
        self.max_buffer_overflows
    }

    pub fn store(&self) -> &Arc<Mutex<SlaveStore>> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Applies one binary frame immediately and returns the reply, if any.
    pub fn process_frame(&self, proto: ModbusProto, frame: &[u8]) -> Option<Vec<u8>> {
        self.stats.record_request();
        let served = self.store.lock().serve_frame(proto, frame);
        match served {
            Served::Reply {
                frame: reply,
                exception,
            } => {
                if exception {
                    self.stats.record_error();
                    log::debug!("Request {frame:02X?} answered with exception {reply:02X?}");
                } else {
                    self.stats.record_response();
                }
                Some(reply)
            }
            Served::Silent => None,
            Served::Malformed(reason) => {
                self.stats.record_error();
                log::warn!("Dropping request {frame:02X?}: {reason}");
                None
            }
        }
    }

    /// Like [`Self::process_frame`], but the reply is held back by the
    /// configured delay. The store is already updated while waiting.
    pub async fn answer(&self, proto: ModbusProto, frame: &[u8]) -> Option<Vec<u8>> {
        let reply = self.process_frame(proto, frame)?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Some(reply)
    }
}

/// A configured slave field bound to its place in the store.
#[derive(Debug, Clone)]
pub struct SlaveField {
    pub key: FieldKey,
    pub unit: u8,
    pub node_id: String,
    pub property_id: String,
    pub entry: FieldEntry,
    /// Bit index for bit tables, register index for word tables
    pub address: u16,
    /// Byte offset inside the word table
    pub byte_address: usize,
}

impl SlaveField {
    pub fn class(&self) -> RegisterClass {
        self.key.class
    }

    /// Registers (or bits) covered by the field.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        let span = if self.class().is_bit() {
            1
        } else {
            self.entry.register_span()
        };
        (0..span).map(move |step| self.address.saturating_add(step))
    }

    pub fn read(&self, store: &SlaveStore) -> Option<FieldValue> {
        let space = store.get_unit(self.unit)?.space(self.class());
        let mut decoded = None;
        match space {
            RegisterSpace::Bits { states, .. } => {
                let state = *states.get(usize::from(self.address))?;
                codec::decode_value(&self.entry, RawValue::Bool(state), |value| {
                    decoded = Some(value)
                });
            }
            RegisterSpace::Words { bytes, .. } => {
                decoded = codec::read_field(&self.entry, bytes, self.byte_address).ok()?;
            }
        }
        decoded
    }

    /// Stores `value` without emitting change notifications.
    pub fn write(&self, store: &mut SlaveStore, value: FieldValue) -> Result<(), CodecError> {
        let space = store.unit(self.unit).space_mut(self.class());
        if let Some(states) = space.states_mut() {
            let slot = states
                .get_mut(usize::from(self.address))
                .ok_or(CodecError::AddressOutOfRange {
                    address: i64::from(self.address),
                })?;
            *slot = value.as_bool();
            return Ok(());
        }
        match space.bytes_mut() {
            Some(bytes) => codec::encode_value(&self.entry, value, bytes, self.byte_address),
            None => Ok(()),
        }
    }
}

/// Bit tables only carry booleans.
pub fn normalize_entry(class: RegisterClass, entry: &FieldEntry) -> FieldEntry {
    let mut entry = entry.clone();
    if class.is_bit() {
        entry.value_type = ValueType::Boolean;
        entry.offset = None;
    }
    entry
}

/// Validates the slave field map and resolves every field's position.
pub fn bind_slave_fields(
    data: &FieldMap,
    default_unit: u8,
    addressing_offset: i64,
) -> Result<Vec<SlaveField>, ConfigError> {
    let mut fields = Vec::new();
    for (key, properties) in data {
        let field_key: FieldKey = key.parse()?;
        let unit = field_key.unit_or(default_unit);
        for (property_id, entry) in properties {
            let bind = || -> Result<SlaveField, CodecError> {
                let entry = normalize_entry(field_key.class, entry);
                codec::validate_field_entry(&entry)?;
                let address = checked_register(property_id, entry.address, addressing_offset)?;
                let byte_address = if field_key.class.is_bit() {
                    0
                } else {
                    let byte_address = codec::buffer_address(
                        property_id,
                        entry.address,
                        addressing_offset,
                        entry.bit_offset(),
                    )?;
                    let end = usize::from(address) + usize::from(entry.register_span());
                    if end > REGISTER_SPACE_LEN {
                        return Err(CodecError::AddressOutOfRange {
                            address: end as i64,
                        });
                    }
                    byte_address as usize
                };
                Ok(SlaveField {
                    key: field_key,
                    unit,
                    node_id: field_key.node_id(),
                    property_id: property_id.clone(),
                    entry,
                    address,
                    byte_address,
                })
            };
            fields.push(bind().map_err(|source| ConfigError::Field {
                key: key.clone(),
                property: property_id.clone(),
                source,
            })?);
        }
    }
    Ok(fields)
}

/// Writes configured defaults and returns the addresses whose initial
/// value should be announced, one entry per `(unit, class, address)`.
pub fn apply_defaults(
    store: &mut SlaveStore,
    fields: &[SlaveField],
) -> Result<Vec<(u8, RegisterClass, u16)>, ConfigError> {
    let mut announce = Vec::new();
    for field in fields {
        store.unit(field.unit);
        if let Some(default) = &field.entry.default {
            FieldValue::from_json(&field.entry, default)
                .and_then(|value| field.write(store, value))
                .map_err(|source| ConfigError::Field {
                    key: field.key.to_string(),
                    property: field.property_id.clone(),
                    source,
                })?;
        }
        let announced = field.class().is_bit()
            || field.entry.default.is_some()
            || field.entry.value_type == ValueType::Boolean;
        let slot = (field.unit, field.class(), field.address);
        if announced && !announce.contains(&slot) {
            announce.push(slot);
        }
    }
    Ok(announce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::modbus::{ClientFrame, RegisterEncoding};

    fn store_with_unit(unit: u8) -> SlaveStore {
        let mut store = SlaveStore::new();
        store.unit(unit);
        store
    }

    #[test]
    fn test_read_bounds() {
        let mut store = store_with_unit(1);
        assert!(store
            .handle_request(
                1,
                &Request::ReadHoldingRegisters {
                    address: 0xFFFF,
                    quantity: 1
                }
            )
            .is_ok());
        assert_eq!(
            store.handle_request(
                1,
                &Request::ReadHoldingRegisters {
                    address: 0xFFFF,
                    quantity: 2
                }
            ),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            store.handle_request(
                1,
                &Request::ReadCoils {
                    address: 0xFFF0,
                    quantity: 17
                }
            ),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_coil_read_is_trimmed() {
        let mut store = store_with_unit(1);
        store
            .handle_request(
                1,
                &Request::WriteMultipleCoils {
                    address: 5,
                    states: vec![true, false, true],
                },
            )
            .unwrap();
        assert_eq!(
            store.handle_request(1, &Request::ReadCoils { address: 4, quantity: 4 }),
            Ok(Response::Bits {
                function: FunctionCode::ReadCoils,
                states: vec![false, true, false, true],
            })
        );
    }

    #[test]
    fn test_unknown_unit_and_zero_quantity() {
        let mut store = store_with_unit(1);
        assert_eq!(
            store.handle_request(9, &Request::ReadCoils { address: 0, quantity: 1 }),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            store.read_space(1, RegisterClass::DigitalInput, 0, 0),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(store.unit_ids(), vec![1]);
    }

    #[test]
    fn test_register_writes_notify_per_register() {
        let mut store = store_with_unit(1);
        let rx0 = store.unit(1).holding_registers.subscribe(10);
        let rx1 = store.unit(1).holding_registers.subscribe(11);
        store
            .handle_request(
                1,
                &Request::WriteMultipleRegisters {
                    address: 10,
                    data: vec![0x12, 0x34, 0xAB, 0xCD],
                },
            )
            .unwrap();
        assert_eq!(rx0.try_recv(), Ok(CellValue::Word(0x1234)));
        assert_eq!(rx1.try_recv(), Ok(CellValue::Word(0xABCD)));
        assert!(rx0.try_recv().is_err());
    }

    #[test]
    fn test_notifications_wrap_at_ten_thousand() {
        let mut store = store_with_unit(1);
        let low = store.unit(1).coils.subscribe(3);
        let high = store.unit(1).coils.subscribe(10003);
        store
            .handle_request(1, &Request::WriteSingleCoil { address: 10003, value: true })
            .unwrap();
        assert_eq!(low.try_recv(), Ok(CellValue::Bit(true)));
        assert!(high.try_recv().is_err());
    }

    #[test]
    fn test_failed_read_write_skips_read_and_keeps_buffer() {
        let mut store = store_with_unit(1);
        store
            .handle_request(1, &Request::WriteSingleRegister { address: 0, value: 7 })
            .unwrap();
        let result = store.handle_request(
            1,
            &Request::ReadWriteMultipleRegisters {
                read_address: 0,
                read_quantity: 1,
                write_address: 0xFFFF,
                data: vec![0, 1, 0, 2],
            },
        );
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(
            store.unit(1).holding_registers.peek(0xFFFF),
            Some(CellValue::Word(0))
        );
        assert_eq!(store.unit(1).holding_registers.peek(0), Some(CellValue::Word(7)));
    }

    #[test]
    fn test_read_write_writes_then_reads() {
        let mut store = store_with_unit(1);
        let result = store.handle_request(
            1,
            &Request::ReadWriteMultipleRegisters {
                read_address: 1,
                read_quantity: 2,
                write_address: 2,
                data: vec![0x00, 0x2A],
            },
        );
        assert_eq!(
            result,
            Ok(Response::Registers {
                function: FunctionCode::ReadWriteMultipleRegisters,
                data: vec![0, 0, 0x00, 0x2A],
            })
        );
    }

    #[tokio::test]
    async fn test_delay_holds_only_the_response() {
        let store = Arc::new(Mutex::new(store_with_unit(1)));
        let service = Arc::new(SlaveService::new(
            store.clone(),
            Some(Duration::from_millis(200)),
            Arc::new(Stats::default()),
        ));
        let request = Request::WriteSingleRegister { address: 3, value: 99 };
        let frame = ClientFrame::new(ModbusProto::Rtu, 1, 0, &request).unwrap();
        let pending = tokio::spawn({
            let service = service.clone();
            let bytes = frame.bytes().to_vec();
            async move { service.answer(ModbusProto::Rtu, &bytes).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.lock().unit(1).holding_registers.peek(3),
            Some(CellValue::Word(99))
        );
        assert!(!pending.is_finished());
        let reply = pending.await.unwrap().unwrap();
        assert_eq!(
            frame.parse(&reply).unwrap(),
            Response::WriteSingleRegister { address: 3, value: 99 }
        );
        assert_eq!(service.stats().snapshot().responses, 1);
    }

    #[test]
    fn test_exception_reply_counts_as_error() {
        let service = SlaveService::new(
            Arc::new(Mutex::new(SlaveStore::new())),
            None,
            Arc::new(Stats::default()),
        );
        let request = Request::ReadInputRegisters { address: 0, quantity: 1 };
        let frame = ClientFrame::new(ModbusProto::TcpUdp, 4, 1, &request).unwrap();
        let reply = service.process_frame(ModbusProto::TcpUdp, frame.bytes()).unwrap();
        assert_eq!(
            frame.parse(&reply).unwrap(),
            Response::Exception {
                function: 0x04,
                code: ExceptionCode::IllegalDataAddress
            }
        );
        assert_eq!(service.stats().snapshot().errors, 1);
        assert_eq!(service.process_frame(ModbusProto::Rtu, &[0x01, 0x03]), None);
        assert_eq!(service.stats().snapshot().errors, 2);
    }

    fn sample_map() -> FieldMap {
        serde_json::from_value(serde_json::json!({
            "AO": {
                "setpoint": { "address": 0, "type": "integer", "register": "UInt16BE", "default": 54321 },
                "mode": { "address": 1, "type": "integer", "offset": 8, "default": 3 },
                "alarm": { "address": 1, "type": "boolean", "offset": 2 }
            },
            "DO#2": {
                "pump": { "address": 4, "type": "boolean", "default": true }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_bind_and_apply_defaults() {
        let fields = bind_slave_fields(&sample_map(), 1, 0).unwrap();
        assert_eq!(fields.len(), 4);

        let mut store = SlaveStore::new();
        let announce = apply_defaults(&mut store, &fields).unwrap();
        assert!(store.has_unit(1) && store.has_unit(2));
        assert_eq!(
            announce,
            vec![
                (1, RegisterClass::AnalogOutput, 1),
                (1, RegisterClass::AnalogOutput, 0),
                (2, RegisterClass::DigitalOutput, 4),
            ]
        );

        let value_of = |property: &str| {
            fields
                .iter()
                .find(|field| field.property_id == property)
                .and_then(|field| field.read(&store))
        };
        assert_eq!(value_of("setpoint"), Some(FieldValue::Int(54321)));
        assert_eq!(value_of("mode"), Some(FieldValue::Int(3)));
        assert_eq!(value_of("alarm"), Some(FieldValue::Bool(false)));
        assert_eq!(value_of("pump"), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_field_write_is_silent_and_keeps_siblings() {
        let fields = bind_slave_fields(&sample_map(), 1, 0).unwrap();
        let mut store = SlaveStore::new();
        apply_defaults(&mut store, &fields).unwrap();
        let rx = store.unit(1).holding_registers.subscribe(1);

        let alarm = fields.iter().find(|f| f.property_id == "alarm").unwrap();
        alarm.write(&mut store, FieldValue::Bool(true)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.unit(1).holding_registers.peek(1),
            Some(CellValue::Word(0x0304))
        );
    }

    #[test]
    fn test_bind_rejects_bad_entries() {
        let data: FieldMap = serde_json::from_value(serde_json::json!({
            "AI": { "level": { "address": 2, "type": "integer", "offset": 3 } }
        }))
        .unwrap();
        assert!(matches!(
            bind_slave_fields(&data, 1, 0),
            Err(ConfigError::Field { .. })
        ));

        let data: FieldMap = serde_json::from_value(serde_json::json!({
            "AI#300": { "level": { "address": 2 } }
        }))
        .unwrap();
        assert_eq!(
            bind_slave_fields(&data, 1, 0).unwrap_err(),
            ConfigError::UnitIdNotImplemented { unit: 300 }
        );

        let entry = FieldEntry {
            address: Some(0xFFFF),
            register: Some(RegisterEncoding::UInt32BE),
            value_type: ValueType::Integer,
            ..Default::default()
        };
        let mut data = FieldMap::new();
        data.entry("AO".to_string())
            .or_default()
            .insert("wide".to_string(), entry);
        assert!(bind_slave_fields(&data, 1, 0).is_err());
    }
}
