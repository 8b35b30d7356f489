/// Homie 4 device published over MQTT
///
/// Every topic lives below `<base_topic><device_id>/`. Nodes and properties
/// are declared before [`HomieBridge::ready`] publishes the advertisement;
/// the advertisement is replayed after every reconnect because the broker
/// session is clean.
///
/// Publishes are queued in order and handed to the MQTT client by one
/// forwarder task, which waits for room in the client's request queue
/// instead of dropping messages.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, Publish, QoS};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;

use crate::{
    api::modbus::traits::{PropertyBridge, SetEvent},
    cli::config::MqttConfig,
    core::task_manager::spawn_task,
    protocol::modbus::ValueType,
};

pub const HOMIE_VERSION: &str = "4.0.0";
const IMPLEMENTATION: &str = "homie-modbus";
const REQUEST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct PropertyInfo {
    label: String,
    datatype: ValueType,
    settable: bool,
}

#[derive(Debug, Clone)]
struct NodeInfo {
    name: String,
    node_type: String,
    properties: BTreeMap<String, PropertyInfo>,
}

/// Device description; produces the retained advertisement messages.
#[derive(Debug, Clone)]
pub struct HomieDevice {
    root: String,
    name: String,
    nodes: BTreeMap<String, NodeInfo>,
}

impl HomieDevice {
    pub fn new(base_topic: &str, device_id: &str, name: &str) -> Self {
        let base = if base_topic.is_empty() || base_topic.ends_with('/') {
            base_topic.to_string()
        } else {
            format!("{base_topic}/")
        };
        Self {
            root: format!("{base}{device_id}"),
            name: name.to_string(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.root)
    }

    /// Filter matching every `set` topic of this device.
    pub fn set_filter(&self) -> String {
        self.topic("+/+/set")
    }

    /// Splits `<root>/<node>/<property>/set` into a set event.
    pub fn parse_set(&self, topic: &str, payload: &[u8]) -> Option<SetEvent> {
        let rest = topic.strip_prefix(&self.root)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let (node_id, property_id, set) = (parts.next()?, parts.next()?, parts.next()?);
        if set != "set" || parts.next().is_some() {
            return None;
        }
        Some(SetEvent {
            node_id: node_id.to_string(),
            property_id: property_id.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    fn declare_node(&mut self, node_id: &str, name: &str, node_type: &str) {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeInfo {
                name: name.to_string(),
                node_type: node_type.to_string(),
                properties: BTreeMap::new(),
            });
        node.name = name.to_string();
        node.node_type = node_type.to_string();
    }

    fn declare_property(&mut self, node_id: &str, property_id: &str, info: PropertyInfo) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("Property {property_id} declared on unknown node {node_id}"))?;
        node.properties.insert(property_id.to_string(), info);
        Ok(())
    }

    /// Retained `(topic, payload)` pairs describing the device.
    pub fn advertisement(&self) -> Vec<(String, String)> {
        let mut messages = vec![
            (self.topic("$homie"), HOMIE_VERSION.to_string()),
            (self.topic("$name"), self.name.clone()),
            (self.topic("$implementation"), IMPLEMENTATION.to_string()),
            (self.topic("$fw/name"), env!("CARGO_PKG_NAME").to_string()),
            (self.topic("$fw/version"), env!("CARGO_PKG_VERSION").to_string()),
            (
                self.topic("$nodes"),
                self.nodes.keys().cloned().collect::<Vec<_>>().join(","),
            ),
        ];
        for (node_id, node) in &self.nodes {
            messages.push((self.topic(&format!("{node_id}/$name")), node.name.clone()));
            messages.push((self.topic(&format!("{node_id}/$type")), node.node_type.clone()));
            messages.push((
                self.topic(&format!("{node_id}/$properties")),
                node.properties.keys().cloned().collect::<Vec<_>>().join(","),
            ));
            for (property_id, property) in &node.properties {
                let prefix = format!("{node_id}/{property_id}");
                messages.push((self.topic(&format!("{prefix}/$name")), property.label.clone()));
                messages.push((
                    self.topic(&format!("{prefix}/$datatype")),
                    property.datatype.to_string(),
                ));
                messages.push((self.topic(&format!("{prefix}/$retained")), "true".to_string()));
                if property.settable {
                    messages.push((self.topic(&format!("{prefix}/$settable")), "true".to_string()));
                }
            }
        }
        messages
    }
}

/// A queued MQTT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Publish {
        topic: String,
        payload: String,
        retained: bool,
    },
    Disconnect,
}

/// Where the forwarder delivers queued operations.
#[async_trait]
pub trait MqttSink: Send + Sync + 'static {
    async fn publish(&self, topic: String, payload: String, retained: bool) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
impl MqttSink for AsyncClient {
    async fn publish(&self, topic: String, payload: String, retained: bool) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retained, payload.into_bytes())
            .await
            .map_err(|err| anyhow!("Failed to queue MQTT publish: {err}"))
    }

    async fn disconnect(&self) -> Result<()> {
        AsyncClient::disconnect(self)
            .await
            .map_err(|err| anyhow!("Error disconnecting from MQTT broker: {err}"))
    }
}

/// Delivers queued operations in order until `Disconnect` or until every
/// sender is gone.
pub fn spawn_forwarder<S: MqttSink>(sink: S, outbound: flume::Receiver<Outbound>) -> JoinHandle<()> {
    spawn_task(async move {
        while let Ok(message) = outbound.recv_async().await {
            let delivered = match message {
                Outbound::Publish {
                    topic,
                    payload,
                    retained,
                } => sink.publish(topic, payload, retained).await,
                Outbound::Disconnect => {
                    if let Err(err) = sink.disconnect().await {
                        log::warn!("{err}");
                    }
                    break;
                }
            };
            if let Err(err) = delivered {
                log::warn!("{err}");
            }
        }
    })
}

fn enqueue(outbound: &flume::Sender<Outbound>, topic: String, payload: &str, retained: bool) {
    let message = Outbound::Publish {
        topic,
        payload: payload.to_string(),
        retained,
    };
    if outbound.send(message).is_err() {
        log::warn!("MQTT forwarder stopped, dropping publish");
    }
}

/// Turns an inbound publish into a set event. With `debug` every inbound
/// message is logged, set topic or not.
fn incoming(device: &HomieDevice, publish: &Publish, debug: bool) -> Option<SetEvent> {
    let topic: &[u8] = publish.topic.as_ref();
    let topic = String::from_utf8_lossy(topic);
    if debug {
        log::info!("MQTT <- {topic} = {}", String::from_utf8_lossy(&publish.payload));
    }
    device.parse_set(&topic, &publish.payload)
}

/// [`PropertyBridge`] backed by an MQTT connection.
pub struct HomieBridge {
    device: Arc<Mutex<HomieDevice>>,
    state: Arc<Mutex<&'static str>>,
    set_rx: flume::Receiver<SetEvent>,
    outbound: flume::Sender<Outbound>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    event_loop: JoinHandle<()>,
    debug: bool,
}

impl HomieBridge {
    /// Starts the MQTT event loop. The connection is established in the
    /// background and re-established on failure.
    pub fn connect(config: &MqttConfig, device_id: &str, name: &str) -> Result<Self> {
        let device = HomieDevice::new(&config.base_topic, device_id, name);
        let client_id = format!("{device_id}-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            device.topic("$state"),
            "lost",
            QoS::AtLeastOnce,
            true,
        ));
        if config.auth {
            let username = config
                .username
                .clone()
                .ok_or_else(|| anyhow!("MQTT auth is enabled but no username is configured"))?;
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (set_tx, set_rx) = flume::unbounded();
        let (outbound, outbound_rx) = flume::unbounded();
        let forwarder = spawn_forwarder(client.clone(), outbound_rx);
        let device = Arc::new(Mutex::new(device));
        let state = Arc::new(Mutex::new("init"));
        let debug = config.debug;

        let event_loop = {
            let client = client.clone();
            let outbound = outbound.clone();
            let device = device.clone();
            let state = state.clone();
            let broker = format!("{}:{}", config.host, config.port);
            spawn_task(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker {broker}");
                            let device = device.lock().clone();
                            if let Err(err) = client.try_subscribe(device.set_filter(), QoS::AtLeastOnce) {
                                log::warn!("Failed to subscribe to set topics: {err}");
                            }
                            let current = *state.lock();
                            if current != "init" {
                                for (topic, payload) in device.advertisement() {
                                    enqueue(&outbound, topic, &payload, true);
                                }
                            }
                            enqueue(&outbound, device.topic("$state"), current, true);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let event = incoming(&device.lock(), &publish, debug);
                            if let Some(event) = event {
                                log::debug!(
                                    "Set {}/{} <- {}",
                                    event.node_id,
                                    event.property_id,
                                    event.payload
                                );
                                if set_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            log::warn!("MQTT connection error: {err}");
                            crate::utils::sleep_1s().await;
                        }
                    }
                }
            })
        };

        Ok(Self {
            device,
            state,
            set_rx,
            outbound,
            forwarder: Mutex::new(Some(forwarder)),
            event_loop,
            debug,
        })
    }

    /// Queues the advertisement followed by `$state ready`.
    pub fn ready(&self) {
        let device = self.device.lock().clone();
        for (topic, payload) in device.advertisement() {
            enqueue(&self.outbound, topic, &payload, true);
        }
        self.set_state("ready");
    }

    /// Publishes `$state disconnected` behind everything already queued,
    /// then closes the connection.
    pub async fn disconnect(&self) {
        self.set_state("disconnected");
        if self.outbound.send(Outbound::Disconnect).is_err() {
            log::warn!("MQTT forwarder already stopped");
        }
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if let Err(err) = forwarder.await {
                log::warn!("MQTT forwarder ended abnormally: {err}");
            }
        }
        self.event_loop.abort();
    }

    fn set_state(&self, state: &'static str) {
        *self.state.lock() = state;
        let topic = self.device.lock().topic("$state");
        enqueue(&self.outbound, topic, state, true);
    }
}

impl PropertyBridge for HomieBridge {
    fn declare_node(&self, node_id: &str, name: &str, node_type: &str) -> Result<()> {
        self.device.lock().declare_node(node_id, name, node_type);
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
        self.device.lock().declare_property(
            node_id,
            property_id,
            PropertyInfo {
                label: label.to_string(),
                datatype,
                settable,
            },
        )
    }

    fn publish(&self, node_id: &str, property_id: &str, value: &str, retained: bool) {
        let topic = self.device.lock().topic(&format!("{node_id}/{property_id}"));
        if self.debug {
            log::info!("{topic} = {value}");
        }
        enqueue(&self.outbound, topic, value, retained);
    }

    fn publish_raw(&self, topic: &str, payload: &str, retained: bool) {
        if topic == "$state" {
            match payload {
                "alert" => *self.state.lock() = "alert",
                "ready" => *self.state.lock() = "ready",
                _ => {}
            }
        }
        let topic = self.device.lock().topic(topic);
        if self.debug {
            log::info!("{topic} = {payload}");
        }
        enqueue(&self.outbound, topic, payload, retained);
    }

    fn set_events(&self) -> flume::Receiver<SetEvent> {
        self.set_rx.clone()
    }
}
