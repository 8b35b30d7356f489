/// Turns the master `requests` section into poll groups.
///
/// A poll group is one periodic transaction: a contiguous window of one
/// register table on one unit, plus the properties decoded from it.
use std::{collections::BTreeMap, time::Duration};

use super::slave::normalize_entry;
use crate::{
    cli::config::{MasterConfig, RequestConfig, RequestType},
    protocol::modbus::{
        codec::{self, checked_register},
        pdu::{MAX_READ_WRITE_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS},
        CodecError, ConfigError, FieldEntry, FieldKey, RegisterClass,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Periodic read; writes go out as separate transactions
    Read,
    /// Combined 0x17 transaction carrying the cached write window
    ReadWrite,
}

/// A property and its absolute position in the register table.
#[derive(Debug, Clone)]
pub struct PropertyBinding {
    pub node_id: String,
    pub property_id: String,
    pub entry: FieldEntry,
    /// Bit index for bit tables, register index for word tables
    pub address: u16,
    /// Absolute byte offset for word tables
    pub byte_address: usize,
}

impl PropertyBinding {
    fn span(&self, class: RegisterClass) -> u16 {
        if class.is_bit() {
            1
        } else {
            self.entry.register_span()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollGroup {
    /// Transaction id, `R<n>_<key>` or `R<n>_<key>_<property>`
    pub id: String,
    pub label: String,
    pub kind: GroupKind,
    pub unit: u8,
    pub class: RegisterClass,
    pub node_id: String,
    pub write_node_id: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub start_address: u16,
    pub quantity: u16,
    pub properties: Vec<PropertyBinding>,
    pub write_start_address: u16,
    pub write_quantity: u16,
    pub write_properties: Vec<PropertyBinding>,
}

impl PollGroup {
    pub fn node_label(&self) -> String {
        format!(
            "Request {} on unit {} : {}",
            self.label,
            self.unit,
            self.class.label()
        )
    }

    /// Byte offset of `binding` inside the read window.
    pub fn relative_byte(&self, binding: &PropertyBinding) -> usize {
        binding.byte_address - usize::from(self.start_address) * 2
    }

    pub fn relative_write_byte(&self, binding: &PropertyBinding) -> usize {
        binding.byte_address - usize::from(self.write_start_address) * 2
    }
}

/// Validates every request and builds its poll groups.
pub fn plan_requests(master: &MasterConfig) -> Result<Vec<PollGroup>, ConfigError> {
    let mut groups = Vec::new();
    for (index, request) in master.requests.iter().enumerate() {
        groups.extend(plan_request(master, index, request)?);
    }
    Ok(groups)
}

fn plan_request(
    master: &MasterConfig,
    index: usize,
    request: &RequestConfig,
) -> Result<Vec<PollGroup>, ConfigError> {
    if let Some(name) = request.unexpected.keys().next() {
        return Err(ConfigError::UnexpectedParameter { name: name.clone() });
    }
    let request_type = match request.request_type.as_deref() {
        None => RequestType::default(),
        Some(name) => name
            .parse::<RequestType>()
            .map_err(|_| ConfigError::UnexpectedParameter {
                name: name.to_string(),
            })?,
    };
    let label = if request.label.is_empty() {
        format!("R{index}")
    } else {
        request.label.clone()
    };
    let interval = Duration::from_millis(request.interval.unwrap_or(master.interval));
    let timeout = Duration::from_millis(request.timeout.unwrap_or(master.timeout));

    if let Some(writedata) = &request.writedata {
        if request_type != RequestType::ReadWrite {
            return Err(ConfigError::UnexpectedParameter {
                name: "writedata".to_string(),
            });
        }
        if let Some(extra) = writedata.keys().find(|key| !request.data.contains_key(*key)) {
            return Err(ConfigError::UnexpectedParameter { name: extra.clone() });
        }
    }

    let mut groups = Vec::new();
    for (key, properties) in &request.data {
        let field_key: FieldKey = key.parse()?;
        let unit = field_key.unit_or(master.unit_id);
        let class = field_key.class;
        if request_type == RequestType::ReadWrite && class != RegisterClass::AnalogOutput {
            return Err(ConfigError::RequestTypeUnavailable {
                request_type: request_type.to_string(),
                key: key.clone(),
            });
        }
        if properties.is_empty() {
            continue;
        }
        let node_id = format!("R{index}-{}", field_key.node_id());
        let bindings = bind_properties(key, class, properties, &node_id, master.addressingoffset)?;

        let template = PollGroup {
            id: format!("R{index}_{key}"),
            label: label.clone(),
            kind: GroupKind::Read,
            unit,
            class,
            node_id: node_id.clone(),
            write_node_id: None,
            interval,
            timeout,
            max_retries: master.max_retries,
            start_address: 0,
            quantity: 0,
            properties: Vec::new(),
            write_start_address: 0,
            write_quantity: 0,
            write_properties: Vec::new(),
        };

        match request_type {
            RequestType::ReadSingle => {
                for binding in bindings {
                    let mut group = PollGroup {
                        id: format!("R{index}_{key}_{}", binding.property_id),
                        ..template.clone()
                    };
                    (group.start_address, group.quantity) =
                        window(&group.id, class, std::slice::from_ref(&binding), read_limit(class))?;
                    group.properties = vec![binding];
                    groups.push(group);
                }
            }
            RequestType::ReadMultiple => {
                let mut group = template;
                (group.start_address, group.quantity) =
                    window(&group.id, class, &bindings, read_limit(class))?;
                group.properties = bindings;
                groups.push(group);
            }
            RequestType::ReadWrite => {
                let mut group = template;
                (group.start_address, group.quantity) =
                    window(&group.id, class, &bindings, read_limit(class))?;
                group.properties = bindings;
                if let Some(writedata) = &request.writedata {
                    let write_properties = writedata.get(key).ok_or_else(|| {
                        ConfigError::ReadBeforeWriteDataMissing { key: key.clone() }
                    })?;
                    let write_node_id = format!("{node_id}-W");
                    let write_bindings = bind_properties(
                        key,
                        class,
                        write_properties,
                        &write_node_id,
                        master.addressingoffset,
                    )?;
                    if write_bindings.is_empty() {
                        return Err(ConfigError::ReadBeforeWriteDataMissing { key: key.clone() });
                    }
                    (group.write_start_address, group.write_quantity) =
                        window(&group.id, class, &write_bindings, MAX_READ_WRITE_REGISTERS)?;
                    group.kind = GroupKind::ReadWrite;
                    group.write_node_id = Some(write_node_id);
                    group.write_properties = write_bindings;
                }
                groups.push(group);
            }
        }
    }
    Ok(groups)
}

/// Largest window a group may span: writable tables are also written back
/// in one request.
fn read_limit(class: RegisterClass) -> u16 {
    match class {
        RegisterClass::DigitalOutput => MAX_WRITE_BITS,
        RegisterClass::AnalogOutput => MAX_WRITE_REGISTERS,
        _ => class.max_read_quantity(),
    }
}

fn bind_properties(
    key: &str,
    class: RegisterClass,
    properties: &BTreeMap<String, FieldEntry>,
    node_id: &str,
    addressing_offset: i64,
) -> Result<Vec<PropertyBinding>, ConfigError> {
    properties
        .iter()
        .map(|(property_id, entry)| {
            let bind = || -> Result<PropertyBinding, CodecError> {
                let entry = normalize_entry(class, entry);
                codec::validate_field_entry(&entry)?;
                let address = checked_register(property_id, entry.address, addressing_offset)?;
                let byte_address = if class.is_bit() {
                    0
                } else {
                    codec::buffer_address(
                        property_id,
                        entry.address,
                        addressing_offset,
                        entry.bit_offset(),
                    )? as usize
                };
                Ok(PropertyBinding {
                    node_id: node_id.to_string(),
                    property_id: property_id.clone(),
                    entry,
                    address,
                    byte_address,
                })
            };
            bind().map_err(|source| ConfigError::Field {
                key: key.to_string(),
                property: property_id.clone(),
                source,
            })
        })
        .collect()
}

/// Smallest `(start, quantity)` covering every binding, wide fields included.
fn window(
    id: &str,
    class: RegisterClass,
    bindings: &[PropertyBinding],
    limit: u16,
) -> Result<(u16, u16), ConfigError> {
    let start = bindings.iter().map(|b| u32::from(b.address)).min().unwrap_or(0);
    let end = bindings
        .iter()
        .map(|b| u32::from(b.address) + u32::from(b.span(class)))
        .max()
        .unwrap_or(start);
    let quantity = end - start;
    if quantity == 0 || quantity > u32::from(limit) || end > 0x10000 {
        return Err(ConfigError::RequestTooLarge {
            id: id.to_string(),
            quantity,
            limit,
        });
    }
    Ok((start as u16, quantity as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(requests: serde_json::Value) -> MasterConfig {
        serde_json::from_value(serde_json::json!({
            "type": "tcp",
            "socketOptions": { "host": "127.0.0.1", "port": 502 },
            "requests": requests,
        }))
        .unwrap()
    }

    #[test]
    fn test_read_multiple_window() {
        let config = master(serde_json::json!([{
            "label": "boiler",
            "data": {
                "AI#3": {
                    "temperature": { "address": 10, "register": "Int16BE" },
                    "energy": { "address": 14, "register": "UInt32BE" },
                    "status": { "address": 12, "offset": 8 }
                }
            }
        }]));
        let groups = plan_requests(&config).unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.id, "R0_AI#3");
        assert_eq!(group.node_id, "R0-AI-3");
        assert_eq!(group.unit, 3);
        assert_eq!(group.kind, GroupKind::Read);
        assert_eq!((group.start_address, group.quantity), (10, 6));
        assert_eq!(group.interval, Duration::from_millis(1000));
        assert_eq!(group.timeout, Duration::from_millis(500));
        assert_eq!(group.node_label(), "Request boiler on unit 3 : Input Register");
        let status = group
            .properties
            .iter()
            .find(|p| p.property_id == "status")
            .unwrap();
        assert_eq!(group.relative_byte(status), 4);
    }

    #[test]
    fn test_read_single_splits_properties() {
        let config = master(serde_json::json!([{
            "ModbusRequestType": "readsingle",
            "interval": 200,
            "data": { "DO": { "valve1": { "address": 3 }, "valve2": { "address": 9 } } }
        }]));
        let groups = plan_requests(&config).unwrap();
        let ids: Vec<_> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["R0_DO_valve1", "R0_DO_valve2"]);
        assert_eq!((groups[1].start_address, groups[1].quantity), (9, 1));
        assert_eq!(groups[0].interval, Duration::from_millis(200));
        assert_eq!(groups[0].node_id, groups[1].node_id);
        assert!(groups[0].properties[0].entry.value_type == crate::protocol::modbus::ValueType::Boolean);
    }

    #[test]
    fn test_read_write_with_writedata() {
        let config = master(serde_json::json!([{
            "ModbusRequestType": "readwrite",
            "data": { "AO": { "level": { "address": 0 } } },
            "writedata": { "AO": { "target": { "address": 20 }, "limit": { "address": 22 } } }
        }]));
        let groups = plan_requests(&config).unwrap();
        let group = &groups[0];
        assert_eq!(group.kind, GroupKind::ReadWrite);
        assert_eq!(group.write_node_id.as_deref(), Some("R0-AO-W"));
        assert_eq!((group.write_start_address, group.write_quantity), (20, 3));
    }

    #[test]
    fn test_read_write_without_writedata_polls_like_read() {
        let config = master(serde_json::json!([{
            "ModbusRequestType": "readwrite",
            "data": { "AO": { "level": { "address": 0 } } }
        }]));
        let groups = plan_requests(&config).unwrap();
        assert_eq!(groups[0].kind, GroupKind::Read);
    }

    #[test]
    fn test_configuration_errors() {
        let cases = [
            (
                serde_json::json!([{ "ModbusRequestType": "readwrite", "data": { "DI": { "a": { "address": 0 } } } }]),
                "request type readwrite is not available for DI",
            ),
            (
                serde_json::json!([{ "ModbusRequestType": "readwrite",
                    "data": { "AO": { "a": { "address": 0 } }, "AO#2": { "b": { "address": 0 } } },
                    "writedata": { "AO": { "a": { "address": 5 } } } }]),
                "AO#2 is read in data but absent from writedata",
            ),
            (
                serde_json::json!([{ "data": { "AO#999": { "a": { "address": 0 } } } }]),
                "Unit ID not implemented: 999",
            ),
            (
                serde_json::json!([{ "ModbusRequestType": "readall", "data": {} }]),
                "Unexpected parameter: readall",
            ),
            (
                serde_json::json!([{ "data": {}, "pollrate": 5 }]),
                "Unexpected parameter: pollrate",
            ),
        ];
        for (requests, message) in cases {
            let error = plan_requests(&master(requests)).unwrap_err();
            assert_eq!(error.to_string(), message);
        }
    }

    #[test]
    fn test_window_limit() {
        let config = master(serde_json::json!([{
            "data": { "AO": { "first": { "address": 0 }, "last": { "address": 200 } } }
        }]));
        assert!(matches!(
            plan_requests(&config),
            Err(ConfigError::RequestTooLarge { quantity: 201, .. })
        ));
    }

    #[test]
    fn test_addressing_offset() {
        let mut config = master(serde_json::json!([{
            "data": { "AO": { "setpoint": { "address": 40001 } } }
        }]));
        config.addressingoffset = 40001;
        let groups = plan_requests(&config).unwrap();
        assert_eq!(groups[0].start_address, 0);
    }
}
