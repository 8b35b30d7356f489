use anyhow::Result;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::task::JoinHandle;

use crate::{
    api::modbus::{
        slave::{apply_defaults, bind_slave_fields, SlaveField, SlaveService, SlaveStore},
        traits::{PropertyBridge, SetEvent},
    },
    cli::config::{endpoint, Endpoint, SlaveConfig},
    core::{stats::Stats, task_manager::spawn_task},
    protocol::{
        modbus::{FieldValue, RegisterClass},
        transport,
    },
};

/// Validated slave configuration with defaults already written.
pub struct SlavePlan {
    pub store: SlaveStore,
    pub fields: Vec<SlaveField>,
    pub announce: Vec<(u8, RegisterClass, u16)>,
    pub endpoint: Endpoint,
    pub delay: Option<std::time::Duration>,
    pub max_buffer_overflows: Option<u32>,
}

/// Checks the slave section and builds the initial store. No socket or
/// serial port is opened here.
pub fn prepare_slave(config: &SlaveConfig) -> Result<SlavePlan> {
    let fields = bind_slave_fields(&config.data, config.unit_id, config.addressingoffset)?;
    let mut store = SlaveStore::new();
    store.unit(config.unit_id);
    let announce = apply_defaults(&mut store, &fields)?;
    let endpoint = endpoint(
        config.transport,
        config.server_options.as_ref(),
        config.serial_port_options.as_ref(),
    )?;
    Ok(SlavePlan {
        store,
        fields,
        announce,
        endpoint,
        delay: config.delay(),
        max_buffer_overflows: config.max_buffer_overflows,
    })
}

/// Publishes field values, skipping repeats.
struct FieldPublisher {
    bridge: Arc<dyn PropertyBridge>,
    fields: Arc<[SlaveField]>,
    last: Mutex<HashMap<usize, FieldValue>>,
}

impl FieldPublisher {
    fn publish(&self, index: usize, value: FieldValue) {
        let field = &self.fields[index];
        {
            let mut last = self.last.lock();
            if last.get(&index) == Some(&value) {
                return;
            }
            last.insert(index, value);
        }
        self.bridge.publish(
            &field.node_id,
            &field.property_id,
            &value.format(&field.entry),
            true,
        );
    }
}

/// Handle to a running slave
pub struct SlaveHandle {
    service: Arc<SlaveService>,
    shutdown_tx: flume::Sender<()>,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SlaveHandle {
    pub fn service(&self) -> &Arc<SlaveService> {
        &self.service
    }

    /// Closes the listener and stops the forwarders.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.server.await {
            log::warn!("Slave listener ended abnormally: {err}");
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Declares the slave properties, wires change notifications to the bridge
/// and starts serving the configured transport.
pub fn start_slave(
    plan: SlavePlan,
    bridge: Arc<dyn PropertyBridge>,
    sets: flume::Receiver<SetEvent>,
    stats: Arc<Stats>,
) -> Result<SlaveHandle> {
    let SlavePlan {
        mut store,
        fields,
        announce,
        endpoint,
        delay,
        max_buffer_overflows,
    } = plan;

    declare(bridge.as_ref(), &fields)?;

    // One subscription per address; fields spanning several registers
    // listen on each of them.
    let mut watchers: BTreeMap<(u8, RegisterClass, u16), Vec<usize>> = BTreeMap::new();
    for (index, field) in fields.iter().enumerate() {
        for address in field.addresses() {
            let watched = watchers
                .entry((field.unit, field.class(), address))
                .or_default();
            if !watched.contains(&index) {
                watched.push(index);
            }
        }
    }
    let receivers: Vec<_> = watchers
        .into_iter()
        .map(|((unit, class, address), indices)| {
            (store.unit(unit).space_mut(class).subscribe(address), indices)
        })
        .collect();
    for (unit, class, address) in announce {
        store.unit(unit).space_mut(class).notify(address);
    }

    let store = Arc::new(Mutex::new(store));
    let fields: Arc<[SlaveField]> = fields.into();
    let publisher = Arc::new(FieldPublisher {
        bridge,
        fields: fields.clone(),
        last: Mutex::new(HashMap::new()),
    });

    let mut tasks = Vec::new();
    for (rx, indices) in receivers {
        let store = store.clone();
        let publisher = publisher.clone();
        tasks.push(spawn_task(async move {
            while rx.recv_async().await.is_ok() {
                let values: Vec<_> = {
                    let store = store.lock();
                    indices
                        .iter()
                        .map(|index| (*index, publisher.fields[*index].read(&store)))
                        .collect()
                };
                for (index, value) in values {
                    if let Some(value) = value {
                        publisher.publish(index, value);
                    }
                }
            }
        }));
    }

    tasks.push(spawn_set_handler(sets, store.clone(), publisher));

    let service = Arc::new(
        SlaveService::new(store, delay, stats.clone())
            .with_max_buffer_overflows(max_buffer_overflows),
    );
    let (shutdown_tx, shutdown_rx) = flume::bounded(1);
    let server = {
        let service = service.clone();
        spawn_task(async move {
            if let Err(err) = transport::serve(&endpoint, service, shutdown_rx).await {
                log::error!("Modbus slave stopped: {err}");
            }
        })
    };

    Ok(SlaveHandle {
        service,
        shutdown_tx,
        server,
        tasks,
    })
}

fn declare(bridge: &dyn PropertyBridge, fields: &[SlaveField]) -> Result<()> {
    let mut declared = Vec::new();
    for field in fields {
        if !declared.contains(&field.node_id) {
            bridge.declare_node(
                &field.node_id,
                &format!("Unit {} : {}", field.unit, field.class().label()),
                &field.class().to_string(),
            )?;
            declared.push(field.node_id.clone());
        }
        bridge.declare_property(
            &field.node_id,
            &field.property_id,
            field.entry.display_label(&field.property_id),
            field.entry.value_type,
            true,
        )?;
    }
    Ok(())
}

/// Stores values set from the MQTT side without emitting change
/// notifications, then echoes the stored value.
fn spawn_set_handler(
    sets: flume::Receiver<SetEvent>,
    store: Arc<Mutex<SlaveStore>>,
    publisher: Arc<FieldPublisher>,
) -> JoinHandle<()> {
    spawn_task(async move {
        while let Ok(set) = sets.recv_async().await {
            let Some(index) = publisher
                .fields
                .iter()
                .position(|f| f.node_id == set.node_id && f.property_id == set.property_id)
            else {
                log::warn!("Set for unknown slave property {}/{}", set.node_id, set.property_id);
                continue;
            };
            let field = &publisher.fields[index];
            let written = FieldValue::parse(&field.entry, &set.payload)
                .and_then(|value| field.write(&mut store.lock(), value).map(|_| value));
            match written {
                Ok(value) => publisher.publish(index, value),
                Err(err) => log::warn!(
                    "Rejected set {}/{} = {}: {err}",
                    set.node_id,
                    set.property_id,
                    set.payload
                ),
            }
        }
    })
}
