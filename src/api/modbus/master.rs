/// Master polling engine
///
/// Owns the last-value caches for every poll group and turns transaction
/// outcomes into property publishes. The engine is synchronous; timing and
/// transport live in the driver (`cli::modbus::master`), which feeds it one
/// event at a time.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use derive_more::{Display, Error};

use super::{
    plan::{GroupKind, PollGroup, PropertyBinding},
    traits::{PropertyBridge, SetEvent},
};
use crate::protocol::modbus::{
    codec, CodecError, ConfigError, FieldValue, RawValue, RegisterClass, Request, Response,
    TransactionError,
};

/// Raw contents of a group's last successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Bits(Vec<bool>),
    Bytes(Vec<u8>),
}

impl CachedValue {
    fn zeroed(class: RegisterClass, quantity: u16) -> Self {
        if class.is_bit() {
            Self::Bits(vec![false; usize::from(quantity)])
        } else {
            Self::Bytes(vec![0; usize::from(quantity) * 2])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    group: usize,
    side: Side,
    position: usize,
}

/// Publish owed once a dedicated write is acknowledged by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub node_id: String,
    pub property_id: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetAction {
    /// Same as the cached value, acknowledged without Modbus traffic
    Unchanged,
    /// Stored in the read-write buffer of `group`, carried by its next cycle
    Deferred { group: usize },
    /// Issue `request` for `group`, then call [`MasterEngine::complete_write`]
    Write {
        group: usize,
        request: Request,
        ack: WriteAck,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum SetError {
    #[display("no property {node_id}/{property_id}")]
    UnknownProperty {
        node_id: String,
        property_id: String,
    },
    #[display("{node_id}/{property_id} is read-only")]
    ReadOnly {
        node_id: String,
        property_id: String,
    },
    #[display("{node_id}/{property_id}: {source}")]
    Codec {
        node_id: String,
        property_id: String,
        source: CodecError,
    },
}

pub struct MasterEngine {
    groups: Arc<[PollGroup]>,
    bridge: Arc<dyn PropertyBridge>,
    cache: HashMap<String, CachedValue>,
    write_buffers: HashMap<String, Vec<u8>>,
    published: HashMap<(String, String), FieldValue>,
    undefined: HashSet<(String, String)>,
    alerted: bool,
    index: HashMap<(String, String), Target>,
}

impl MasterEngine {
    /// Builds the engine and fills read-write buffers with their defaults.
    pub fn new(
        groups: Vec<PollGroup>,
        bridge: Arc<dyn PropertyBridge>,
    ) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        let mut write_buffers = HashMap::new();
        for (group_index, group) in groups.iter().enumerate() {
            for (position, binding) in group.properties.iter().enumerate() {
                index.insert(
                    property_key(binding),
                    Target {
                        group: group_index,
                        side: Side::Read,
                        position,
                    },
                );
            }
            if group.kind != GroupKind::ReadWrite {
                continue;
            }
            let mut buffer = vec![0u8; usize::from(group.write_quantity) * 2];
            for (position, binding) in group.write_properties.iter().enumerate() {
                index.insert(
                    property_key(binding),
                    Target {
                        group: group_index,
                        side: Side::Write,
                        position,
                    },
                );
                if let Some(default) = &binding.entry.default {
                    FieldValue::from_json(&binding.entry, default)
                        .and_then(|value| {
                            codec::encode_value(
                                &binding.entry,
                                value,
                                &mut buffer,
                                group.relative_write_byte(binding),
                            )
                        })
                        .map_err(|source| ConfigError::Field {
                            key: group.id.clone(),
                            property: binding.property_id.clone(),
                            source,
                        })?;
                }
            }
            write_buffers.insert(group.id.clone(), buffer);
        }
        Ok(Self {
            groups: groups.into(),
            bridge,
            cache: HashMap::new(),
            write_buffers,
            published: HashMap::new(),
            undefined: HashSet::new(),
            alerted: false,
            index,
        })
    }

    pub fn groups(&self) -> Arc<[PollGroup]> {
        self.groups.clone()
    }

    pub fn cached(&self, group: usize) -> Option<&CachedValue> {
        self.groups
            .get(group)
            .and_then(|group| self.cache.get(&group.id))
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted
    }

    /// Declares every node and property, then publishes the write-side
    /// values of read-write groups.
    pub fn advertise(&mut self) -> anyhow::Result<()> {
        let groups = self.groups.clone();
        let mut declared_nodes = HashSet::new();
        for group in groups.iter() {
            let read_label = match group.kind {
                GroupKind::Read => group.node_label(),
                GroupKind::ReadWrite => format!("{} readings", group.node_label()),
            };
            if declared_nodes.insert(group.node_id.clone()) {
                self.bridge
                    .declare_node(&group.node_id, &read_label, &group.class.to_string())?;
            }
            let settable = group.kind == GroupKind::Read && group.class.is_writable();
            for binding in &group.properties {
                self.bridge.declare_property(
                    &binding.node_id,
                    &binding.property_id,
                    binding.entry.display_label(&binding.property_id),
                    binding.entry.value_type,
                    settable,
                )?;
            }
            let Some(write_node_id) = &group.write_node_id else {
                continue;
            };
            if declared_nodes.insert(write_node_id.clone()) {
                self.bridge.declare_node(
                    write_node_id,
                    &format!("{} writings", group.node_label()),
                    &group.class.to_string(),
                )?;
            }
            for binding in &group.write_properties {
                self.bridge.declare_property(
                    &binding.node_id,
                    &binding.property_id,
                    binding.entry.display_label(&binding.property_id),
                    binding.entry.value_type,
                    true,
                )?;
            }
        }

        for group in groups.iter().filter(|g| g.kind == GroupKind::ReadWrite) {
            let Some(buffer) = self.write_buffers.get(&group.id).cloned() else {
                continue;
            };
            for binding in &group.write_properties {
                if let Ok(Some(value)) =
                    codec::read_field(&binding.entry, &buffer, group.relative_write_byte(binding))
                {
                    self.publish_if_changed(binding, value);
                }
            }
        }
        Ok(())
    }

    /// The next transaction for `group`.
    pub fn build_request(&self, group: usize) -> Option<Request> {
        let group = self.groups.get(group)?;
        let request = match group.kind {
            GroupKind::ReadWrite => Request::ReadWriteMultipleRegisters {
                read_address: group.start_address,
                read_quantity: group.quantity,
                write_address: group.write_start_address,
                data: self.write_buffers.get(&group.id).cloned().unwrap_or_else(|| {
                    vec![0; usize::from(group.write_quantity) * 2]
                }),
            },
            GroupKind::Read => {
                Request::read(group.class.read_code(), group.start_address, group.quantity)?
            }
        };
        Some(request)
    }

    /// Applies the outcome of a poll transaction built by [`Self::build_request`].
    pub fn handle_outcome(&mut self, group: usize, outcome: Result<Response, TransactionError>) {
        let Some(poll) = self.groups.get(group).cloned() else {
            return;
        };
        let expected = match poll.kind {
            GroupKind::ReadWrite => 0x17,
            GroupKind::Read => u8::from(poll.class.read_code()),
        };
        let response = match outcome {
            Ok(Response::Exception { code, .. }) => {
                self.fail(&poll, &TransactionError::Exception { code });
                return;
            }
            Ok(response) => response,
            Err(err) => {
                self.fail(&poll, &err);
                return;
            }
        };
        if response.function_code() != expected {
            let err = TransactionError::UnexpectedResponseCode {
                expected,
                received: response.function_code(),
            };
            log::warn!("[{}] {err}", poll.id);
            return;
        }

        let cached = match response {
            Response::Bits { states, .. } if states.len() >= usize::from(poll.quantity) => {
                CachedValue::Bits(states)
            }
            Response::Registers { data, .. } if data.len() >= usize::from(poll.quantity) * 2 => {
                CachedValue::Bytes(data)
            }
            other => {
                log::warn!("[{}] short or malformed response: {other:?}", poll.id);
                return;
            }
        };

        let mut decoded = Vec::with_capacity(poll.properties.len());
        for binding in &poll.properties {
            match decode_binding(&poll, binding, &cached) {
                Ok(Some(value)) => decoded.push((binding, value)),
                Ok(None) => {}
                Err(err) => log::warn!("[{}] {}: {err}", poll.id, binding.property_id),
            }
        }
        self.cache.insert(poll.id.clone(), cached);
        for (binding, value) in decoded {
            self.publish_if_changed(binding, value);
        }
        if self.alerted && self.undefined.is_empty() {
            self.alerted = false;
            log::info!("All properties defined again");
            self.bridge.publish_raw("$state", "ready", true);
        }
    }

    fn fail(&mut self, poll: &PollGroup, err: &TransactionError) {
        log::warn!("[{}] unit {}: {err}", poll.id, poll.unit);
        for binding in &poll.properties {
            let key = property_key(binding);
            if self.undefined.contains(&key) {
                continue;
            }
            if self.published.contains_key(&key) {
                self.bridge.publish_raw(
                    &format!("{}/{}/$indeterminate", binding.node_id, binding.property_id),
                    "true",
                    true,
                );
            }
            self.undefined.insert(key);
        }
        self.cache
            .entry(poll.id.clone())
            .or_insert_with(|| CachedValue::zeroed(poll.class, poll.quantity));
        if !self.alerted && !self.undefined.is_empty() {
            self.alerted = true;
            self.bridge.publish_raw("$state", "alert", true);
        }
    }

    fn publish_if_changed(&mut self, binding: &PropertyBinding, value: FieldValue) {
        let key = property_key(binding);
        if self.undefined.remove(&key) && self.published.contains_key(&key) {
            self.bridge.publish_raw(
                &format!("{}/{}/$indeterminate", binding.node_id, binding.property_id),
                "false",
                true,
            );
        }
        if self.published.get(&key) == Some(&value) {
            return;
        }
        self.bridge.publish(
            &binding.node_id,
            &binding.property_id,
            &value.format(&binding.entry),
            true,
        );
        self.published.insert(key, value);
    }

    /// Merges an inbound set into the caches and decides what to send.
    pub fn handle_set(&mut self, event: &SetEvent) -> Result<SetAction, SetError> {
        let key = (event.node_id.clone(), event.property_id.clone());
        let target = *self
            .index
            .get(&key)
            .ok_or_else(|| SetError::UnknownProperty {
                node_id: event.node_id.clone(),
                property_id: event.property_id.clone(),
            })?;
        let groups = self.groups.clone();
        let poll = &groups[target.group];
        let codec_error = |source| SetError::Codec {
            node_id: event.node_id.clone(),
            property_id: event.property_id.clone(),
            source,
        };

        match target.side {
            Side::Write => {
                let binding = &poll.write_properties[target.position];
                let value = FieldValue::parse(&binding.entry, &event.payload).map_err(codec_error)?;
                let at = poll.relative_write_byte(binding);
                let buffer = self
                    .write_buffers
                    .entry(poll.id.clone())
                    .or_insert_with(|| vec![0; usize::from(poll.write_quantity) * 2]);
                let current = codec::read_field(&binding.entry, buffer, at).map_err(codec_error)?;
                if current == Some(value) {
                    self.acknowledge(binding, value);
                    return Ok(SetAction::Unchanged);
                }
                codec::encode_value(&binding.entry, value, buffer, at).map_err(codec_error)?;
                self.acknowledge(binding, value);
                Ok(SetAction::Deferred {
                    group: target.group,
                })
            }
            Side::Read => {
                let binding = &poll.properties[target.position];
                if poll.kind != GroupKind::Read || !poll.class.is_writable() {
                    return Err(SetError::ReadOnly {
                        node_id: event.node_id.clone(),
                        property_id: event.property_id.clone(),
                    });
                }
                let value = FieldValue::parse(&binding.entry, &event.payload).map_err(codec_error)?;
                let cached = self
                    .cache
                    .entry(poll.id.clone())
                    .or_insert_with(|| CachedValue::zeroed(poll.class, poll.quantity));
                if self.published.contains_key(&key)
                    && decode_binding(poll, binding, cached).map_err(codec_error)? == Some(value)
                {
                    self.acknowledge(binding, value);
                    return Ok(SetAction::Unchanged);
                }
                let request = match cached {
                    CachedValue::Bits(states) => {
                        let bit = usize::from(binding.address - poll.start_address);
                        let slot = states.get_mut(bit).ok_or_else(|| {
                            codec_error(CodecError::AddressOutOfRange {
                                address: i64::from(binding.address),
                            })
                        })?;
                        *slot = value.as_bool();
                        if poll.quantity == 1 {
                            Request::WriteSingleCoil {
                                address: poll.start_address,
                                value: value.as_bool(),
                            }
                        } else {
                            Request::WriteMultipleCoils {
                                address: poll.start_address,
                                states: states.clone(),
                            }
                        }
                    }
                    CachedValue::Bytes(bytes) => {
                        codec::encode_value(
                            &binding.entry,
                            value,
                            bytes,
                            poll.relative_byte(binding),
                        )
                        .map_err(codec_error)?;
                        if poll.quantity == 1 {
                            Request::WriteSingleRegister {
                                address: poll.start_address,
                                value: u16::from_be_bytes([bytes[0], bytes[1]]),
                            }
                        } else {
                            Request::WriteMultipleRegisters {
                                address: poll.start_address,
                                data: bytes.clone(),
                            }
                        }
                    }
                };
                Ok(SetAction::Write {
                    group: target.group,
                    request,
                    ack: WriteAck {
                        node_id: binding.node_id.clone(),
                        property_id: binding.property_id.clone(),
                        value,
                    },
                })
            }
        }
    }

    /// Publishes the written value once the device accepted the write.
    pub fn complete_write(&mut self, ack: WriteAck, outcome: Result<Response, TransactionError>) {
        let outcome = match outcome {
            Ok(Response::Exception { code, .. }) => Err(TransactionError::Exception { code }),
            other => other,
        };
        match outcome {
            Ok(_) => {
                let key = (ack.node_id.clone(), ack.property_id.clone());
                if let Some(target) = self.index.get(&key).copied() {
                    let binding = self.groups[target.group].properties[target.position].clone();
                    self.acknowledge(&binding, ack.value);
                }
            }
            Err(err) => log::warn!("Write of {}/{} failed: {err}", ack.node_id, ack.property_id),
        }
    }

    fn acknowledge(&mut self, binding: &PropertyBinding, value: FieldValue) {
        self.bridge.publish(
            &binding.node_id,
            &binding.property_id,
            &value.format(&binding.entry),
            true,
        );
        self.published.insert(property_key(binding), value);
    }
}

fn property_key(binding: &PropertyBinding) -> (String, String) {
    (binding.node_id.clone(), binding.property_id.clone())
}

fn decode_binding(
    poll: &PollGroup,
    binding: &PropertyBinding,
    cached: &CachedValue,
) -> Result<Option<FieldValue>, CodecError> {
    match cached {
        CachedValue::Bits(states) => {
            let bit = usize::from(binding.address - poll.start_address);
            let state = *states.get(bit).ok_or(CodecError::AddressOutOfRange {
                address: i64::from(binding.address),
            })?;
            let mut decoded = None;
            codec::decode_value(&binding.entry, RawValue::Bool(state), |value| {
                decoded = Some(value)
            });
            Ok(decoded)
        }
        CachedValue::Bytes(bytes) => {
            codec::read_field(&binding.entry, bytes, poll.relative_byte(binding))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::modbus::{plan::plan_requests, traits::RecordingBridge},
        cli::config::MasterConfig,
        protocol::modbus::{ExceptionCode, FunctionCode},
    };

    fn engine(requests: serde_json::Value) -> (MasterEngine, Arc<RecordingBridge>) {
        let config: MasterConfig = serde_json::from_value(serde_json::json!({
            "type": "tcp",
            "socketOptions": { "host": "127.0.0.1", "port": 502 },
            "requests": requests,
        }))
        .unwrap();
        let bridge = Arc::new(RecordingBridge::new());
        let engine = MasterEngine::new(plan_requests(&config).unwrap(), bridge.clone()).unwrap();
        (engine, bridge)
    }

    fn holding(data: &[u8]) -> Result<Response, TransactionError> {
        Ok(Response::Registers {
            function: FunctionCode::ReadHoldingRegisters,
            data: data.to_vec(),
        })
    }

    fn set(node: &str, property: &str, payload: &str) -> SetEvent {
        SetEvent {
            node_id: node.to_string(),
            property_id: property.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_publishes_only_changes() {
        let (mut engine, bridge) = engine(serde_json::json!([{
            "data": { "AO": {
                "low": { "address": 0, "offset": 0, "register": "UInt8" },
                "high": { "address": 0, "offset": 8, "register": "UInt8" }
            } }
        }]));
        engine.handle_outcome(0, holding(&[0x12, 0x34]));
        engine.handle_outcome(0, holding(&[0x12, 0x34]));
        engine.handle_outcome(0, holding(&[0x13, 0x34]));
        assert_eq!(bridge.values_of("R0-AO", "low"), vec!["52"]);
        assert_eq!(bridge.values_of("R0-AO", "high"), vec!["18", "19"]);
    }

    #[test]
    fn test_alert_and_ready_transitions() {
        let (mut engine, bridge) = engine(serde_json::json!([{
            "data": { "AO": { "level": { "address": 0 } } }
        }]));
        engine.handle_outcome(0, holding(&[0, 7]));
        engine.handle_outcome(0, Err(TransactionError::Timeout));
        engine.handle_outcome(
            0,
            Ok(Response::Exception {
                function: 0x03,
                code: ExceptionCode::ServerDeviceBusy,
            }),
        );
        assert!(engine.is_alerted());
        assert_eq!(bridge.raw_payloads("$state"), vec!["alert"]);
        assert_eq!(bridge.raw_payloads("R0-AO/level/$indeterminate"), vec!["true"]);

        engine.handle_outcome(0, holding(&[0, 7]));
        engine.handle_outcome(0, holding(&[0, 7]));
        assert_eq!(bridge.raw_payloads("$state"), vec!["alert", "ready"]);
        assert_eq!(
            bridge.raw_payloads("R0-AO/level/$indeterminate"),
            vec!["true", "false"]
        );
        assert_eq!(bridge.values_of("R0-AO", "level"), vec!["7"]);
    }

    #[test]
    fn test_undefined_without_value_skips_marker() {
        let (mut engine, bridge) = engine(serde_json::json!([{
            "data": { "AO": { "level": { "address": 0 } } }
        }]));
        engine.handle_outcome(0, Err(TransactionError::Closed));
        assert!(bridge.raw_payloads("R0-AO/level/$indeterminate").is_empty());
        assert_eq!(engine.cached(0), Some(&CachedValue::Bytes(vec![0, 0])));
    }

    #[test]
    fn test_unexpected_function_code_abandons_cycle() {
        let (mut engine, bridge) = engine(serde_json::json!([{
            "data": { "AO": { "level": { "address": 0 } } }
        }]));
        engine.handle_outcome(
            0,
            Ok(Response::Registers {
                function: FunctionCode::ReadInputRegisters,
                data: vec![0, 1],
            }),
        );
        assert!(bridge.published().is_empty());
        assert!(!engine.is_alerted());
        assert_eq!(engine.cached(0), None);
    }

    #[test]
    fn test_unchanged_set_short_circuits() {
        let (mut engine, _bridge) = engine(serde_json::json!([{
            "data": { "AO": { "level": { "address": 0 } } }
        }]));
        engine.handle_outcome(0, holding(&[0, 5]));
        assert_eq!(
            engine.handle_set(&set("R0-AO", "level", "5")),
            Ok(SetAction::Unchanged)
        );
    }

    #[test]
    fn test_single_and_multiple_writes() {
        let (mut engine, bridge) = engine(serde_json::json!([
            { "data": { "AO": { "level": { "address": 4 } } } },
            { "data": { "AO": {
                "low": { "address": 0, "offset": 0, "register": "UInt8" },
                "high": { "address": 0, "offset": 8, "register": "UInt8" },
                "flow": { "address": 1 }
            } } }
        ]));
        let action = engine.handle_set(&set("R0-AO", "level", "300")).unwrap();
        let SetAction::Write { request, ack, .. } = action else {
            panic!("expected a write, got {action:?}");
        };
        assert_eq!(
            request,
            Request::WriteSingleRegister {
                address: 4,
                value: 300
            }
        );
        assert!(bridge.values_of("R0-AO", "level").is_empty());
        engine.complete_write(
            ack,
            Ok(Response::WriteSingleRegister {
                address: 4,
                value: 300,
            }),
        );
        assert_eq!(bridge.values_of("R0-AO", "level"), vec!["300"]);

        engine.handle_outcome(1, holding(&[0x03, 0x04, 0x00, 0x09]));
        let action = engine.handle_set(&set("R1-AO", "low", "255")).unwrap();
        assert!(matches!(
            action,
            SetAction::Write {
                request: Request::WriteMultipleRegisters { address: 0, ref data },
                ..
            } if data == &vec![0x03, 0xFF, 0x00, 0x09]
        ));
    }

    #[test]
    fn test_failed_write_is_not_acknowledged() {
        let (mut engine, bridge) = engine(serde_json::json!([
            { "data": { "DO": { "valve": { "address": 2 } } } }
        ]));
        let SetAction::Write { request, ack, .. } =
            engine.handle_set(&set("R0-DO", "valve", "true")).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(
            request,
            Request::WriteSingleCoil {
                address: 2,
                value: true
            }
        );
        engine.complete_write(
            ack,
            Ok(Response::Exception {
                function: 0x05,
                code: ExceptionCode::IllegalDataAddress,
            }),
        );
        assert!(bridge.values_of("R0-DO", "valve").is_empty());
    }

    #[test]
    fn test_read_write_defers_to_next_cycle() {
        let (mut engine, bridge) = engine(serde_json::json!([{
            "ModbusRequestType": "readwrite",
            "data": { "AO": { "level": { "address": 0 } } },
            "writedata": { "AO": { "target": { "address": 10, "default": 12 } } }
        }]));
        engine.advertise().unwrap();
        assert_eq!(bridge.values_of("R0-AO-W", "target"), vec!["12"]);
        assert_eq!(
            engine.handle_set(&set("R0-AO-W", "target", "40")),
            Ok(SetAction::Deferred { group: 0 })
        );
        assert_eq!(bridge.values_of("R0-AO-W", "target"), vec!["12", "40"]);
        assert_eq!(
            engine.build_request(0),
            Some(Request::ReadWriteMultipleRegisters {
                read_address: 0,
                read_quantity: 1,
                write_address: 10,
                data: vec![0, 40],
            })
        );
        assert!(matches!(
            engine.handle_set(&set("R0-AO", "level", "1")),
            Err(SetError::ReadOnly { .. })
        ));
        let declared = bridge.declared();
        assert!(declared.contains(&(
            "R0-AO-W".to_string(),
            "target".to_string(),
            crate::protocol::modbus::ValueType::Integer,
            true
        )));
    }

    #[test]
    fn test_out_of_range_set_leaves_cache_untouched() {
        let (mut engine, _bridge) = engine(serde_json::json!([{
            "data": { "AO": { "level": { "address": 0, "register": "UInt16BE" } } }
        }]));
        engine.handle_outcome(0, holding(&[0, 1]));
        assert!(matches!(
            engine.handle_set(&set("R0-AO", "level", "65536")),
            Err(SetError::Codec {
                source: CodecError::OutOfRange { .. },
                ..
            })
        ));
        assert_eq!(engine.cached(0), Some(&CachedValue::Bytes(vec![0, 1])));
    }
}
