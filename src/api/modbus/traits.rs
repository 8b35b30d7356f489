/// Core Modbus API traits
///
/// `ModbusClient` is the master-side view of a Modbus engine: one framed
/// request in, one response (or exception) out. `PropertyBridge` is the
/// contract towards the MQTT side: node/property declaration, retained
/// publishes and inbound set events.
///
/// The Homie module provides the MQTT implementation; the handlers here are
/// used when no broker is configured and by tests.
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::protocol::modbus::{Request, Response, TransactionError, ValueType};

/// Master side of a Modbus engine.
///
/// Implementations only move frames; retries and timeouts are applied by
/// [`super::core::transact`].
#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn call(&self, unit: u8, request: &Request) -> Result<Response, TransactionError>;
}

/// A settable-property write received from the MQTT side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEvent {
    pub node_id: String,
    pub property_id: String,
    pub payload: String,
}

/// Property model the Modbus side publishes into.
///
/// The bridge does no decoding; payloads arrive and leave as strings.
pub trait PropertyBridge: Send + Sync {
    fn declare_node(&self, node_id: &str, name: &str, node_type: &str) -> Result<()>;

    fn declare_property(
        &self,
        node_id: &str,
        property_id: &str,
        label: &str,
        datatype: ValueType,
        settable: bool,
    ) -> Result<()>;

    fn publish(&self, node_id: &str, property_id: &str, value: &str, retained: bool);

    /// Publish below the device topic, e.g. `$state`.
    fn publish_raw(&self, topic: &str, payload: &str, retained: bool);

    /// Stream of set events for settable properties.
    fn set_events(&self) -> flume::Receiver<SetEvent>;
}

/// Bridge that drops everything (useful for testing)
pub struct NoOpBridge {
    set_rx: flume::Receiver<SetEvent>,
    _set_tx: flume::Sender<SetEvent>,
}

impl NoOpBridge {
    pub fn new() -> Self {
        let (set_tx, set_rx) = flume::unbounded();
        Self {
            set_rx,
            _set_tx: set_tx,
        }
    }
}

impl Default for NoOpBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBridge for NoOpBridge {
    fn declare_node(&self, _node_id: &str, _name: &str, _node_type: &str) -> Result<()> {
        Ok(())
    }

    fn declare_property(
        &self,
        _node_id: &str,
        _property_id: &str,
        _label: &str,
        _datatype: ValueType,
        _settable: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn publish(&self, _node_id: &str, _property_id: &str, _value: &str, _retained: bool) {}

    fn publish_raw(&self, _topic: &str, _payload: &str, _retained: bool) {}

    fn set_events(&self) -> flume::Receiver<SetEvent> {
        self.set_rx.clone()
    }
}

/// Bridge that logs publishes to the console, used when no broker is set up
pub struct LoggingBridge {
    set_rx: flume::Receiver<SetEvent>,
    _set_tx: flume::Sender<SetEvent>,
}

impl LoggingBridge {
    pub fn new() -> Self {
        let (set_tx, set_rx) = flume::unbounded();
        Self {
            set_rx,
            _set_tx: set_tx,
        }
    }
}

impl Default for LoggingBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBridge for LoggingBridge {
    fn declare_node(&self, node_id: &str, name: &str, node_type: &str) -> Result<()> {
        log::debug!("Node {node_id}: {name} ({node_type})");
        Ok(())
    }

    fn declare_property(
        &self,
        node_id: &str,
        property_id: &str,
        label: &str,
        datatype: ValueType,
        settable: bool,
    ) -> Result<()> {
        log::debug!("Property {node_id}/{property_id}: {label} [{datatype}, settable={settable}]");
        Ok(())
    }

    fn publish(&self, node_id: &str, property_id: &str, value: &str, _retained: bool) {
        log::info!("{node_id}/{property_id} = {value}");
    }

    fn publish_raw(&self, topic: &str, payload: &str, _retained: bool) {
        log::info!("{topic} = {payload}");
    }

    fn set_events(&self) -> flume::Receiver<SetEvent> {
        self.set_rx.clone()
    }
}

/// One publish captured by [`RecordingBridge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Property {
        node_id: String,
        property_id: String,
        value: String,
    },
    Raw {
        topic: String,
        payload: String,
    },
}

/// Bridge that records every call and lets the caller inject set events
pub struct RecordingBridge {
    published: Mutex<Vec<Published>>,
    declared: Mutex<Vec<(String, String, ValueType, bool)>>,
    set_tx: flume::Sender<SetEvent>,
    set_rx: flume::Receiver<SetEvent>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        let (set_tx, set_rx) = flume::unbounded();
        Self {
            published: Mutex::new(Vec::new()),
            declared: Mutex::new(Vec::new()),
            set_tx,
            set_rx,
        }
    }

    pub fn inject_set(&self, node_id: &str, property_id: &str, payload: &str) {
        let _ = self.set_tx.send(SetEvent {
            node_id: node_id.to_string(),
            property_id: property_id.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    /// Values published for one property, oldest first.
    pub fn values_of(&self, node_id: &str, property_id: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Published::Property {
                    node_id: node,
                    property_id: property,
                    value,
                } if node == node_id && property == property_id => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn raw_payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Published::Raw { topic: t, payload } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(node, property, datatype, settable)` for every declared property.
    pub fn declared(&self) -> Vec<(String, String, ValueType, bool)> {
        self.declared.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for RecordingBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBridge for RecordingBridge {
    fn declare_node(&self, _node_id: &str, _name: &str, _node_type: &str) -> Result<()> {
        Ok(())
    }

    fn declare_property(
        &self,
        node_id: &str,
        property_id: &str,
        _label: &str,
        datatype: ValueType,
        settable: bool,
    ) -> Result<()> {
        self.declared.lock().push((
            node_id.to_string(),
            property_id.to_string(),
            datatype,
            settable,
        ));
        Ok(())
    }

    fn publish(&self, node_id: &str, property_id: &str, value: &str, _retained: bool) {
        self.published.lock().push(Published::Property {
            node_id: node_id.to_string(),
            property_id: property_id.to_string(),
            value: value.to_string(),
        });
    }

    fn publish_raw(&self, topic: &str, payload: &str, _retained: bool) {
        self.published.lock().push(Published::Raw {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    fn set_events(&self) -> flume::Receiver<SetEvent> {
        self.set_rx.clone()
    }
}
