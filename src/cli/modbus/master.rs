use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

use crate::{
    api::modbus::{
        core::transact,
        master::{MasterEngine, SetAction, WriteAck},
        plan::{plan_requests, GroupKind, PollGroup},
        traits::{ModbusClient, SetEvent},
    },
    cli::config::{endpoint, Endpoint, MasterConfig},
    core::{stats::Stats, task_manager::spawn_task},
    protocol::modbus::{Response, TransactionError},
};

/// Validated master configuration, ready to be started.
pub struct MasterPlan {
    pub groups: Vec<PollGroup>,
    pub endpoint: Endpoint,
}

/// Checks the master section without touching the network.
pub fn prepare_master(config: &MasterConfig) -> Result<MasterPlan> {
    let groups = plan_requests(config)?;
    let endpoint = endpoint(
        config.transport,
        config.socket_options.as_ref(),
        config.serial_port_options.as_ref(),
    )?;
    for group in &groups {
        log::debug!(
            "Transaction {}: unit {} {} [{}..+{}] every {:?}",
            group.id,
            group.unit,
            group.class,
            group.start_address,
            group.quantity,
            group.interval
        );
    }
    Ok(MasterPlan { groups, endpoint })
}

enum DriverEvent {
    Tick(usize),
    Completion {
        group: usize,
        started: Instant,
        outcome: Result<Response, TransactionError>,
    },
    WriteDone {
        ack: WriteAck,
        outcome: Result<Response, TransactionError>,
    },
}

#[derive(Default)]
struct GroupState {
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

/// Handle to a running master driver
pub struct MasterHandle {
    shutdown_tx: flume::Sender<()>,
    task: JoinHandle<()>,
}

impl MasterHandle {
    /// Stops issuing transactions and waits for the driver to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            log::warn!("Master driver ended abnormally: {err}");
        }
    }
}

/// Spawns the driver task that owns `engine`.
///
/// Every group is polled right away. A read group is re-armed so that its
/// next poll starts one interval after the previous one started; a
/// read-write group waits a full interval after completion, unless a write
/// into its buffer pulls the next cycle forward. A group never has two
/// transactions in flight.
pub fn start_master(
    engine: MasterEngine,
    client: Arc<dyn ModbusClient>,
    sets: flume::Receiver<SetEvent>,
    stats: Arc<Stats>,
) -> MasterHandle {
    stats.reset();
    let (shutdown_tx, shutdown_rx) = flume::bounded(1);
    let task = spawn_task(async move {
        let mut driver = Driver::new(engine, client, stats);
        driver.run(sets, shutdown_rx).await;
    });
    MasterHandle { shutdown_tx, task }
}

struct Driver {
    engine: MasterEngine,
    groups: Arc<[PollGroup]>,
    client: Arc<dyn ModbusClient>,
    stats: Arc<Stats>,
    states: Vec<GroupState>,
    events_tx: flume::Sender<DriverEvent>,
    events_rx: flume::Receiver<DriverEvent>,
}

impl Driver {
    fn new(engine: MasterEngine, client: Arc<dyn ModbusClient>, stats: Arc<Stats>) -> Self {
        let groups = engine.groups();
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            states: groups.iter().map(|_| GroupState::default()).collect(),
            engine,
            groups,
            client,
            stats,
            events_tx,
            events_rx,
        }
    }

    async fn run(&mut self, sets: flume::Receiver<SetEvent>, shutdown: flume::Receiver<()>) {
        for group in 0..self.groups.len() {
            self.issue(group);
        }
        let mut sets_open = true;
        loop {
            tokio::select! {
                event = self.events_rx.recv_async() => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                }
                set = sets.recv_async(), if sets_open => match set {
                    Ok(set) => self.handle_set(set),
                    Err(_) => sets_open = false,
                },
                _ = shutdown.recv_async() => break,
            }
        }
        for state in &mut self.states {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        log::info!("Master driver stopped");
    }

    fn issue(&mut self, group: usize) {
        let state = &mut self.states[group];
        if state.in_flight {
            return;
        }
        let Some(request) = self.engine.build_request(group) else {
            return;
        };
        state.in_flight = true;
        self.stats.record_request();
        let poll = self.groups[group].clone();
        let client = self.client.clone();
        let events_tx = self.events_tx.clone();
        spawn_task(async move {
            let started = Instant::now();
            let outcome = transact(
                client.as_ref(),
                poll.unit,
                &request,
                poll.timeout,
                poll.max_retries,
            )
            .await;
            let _ = events_tx.send(DriverEvent::Completion {
                group,
                started,
                outcome,
            });
        });
    }

    fn arm(&mut self, group: usize, delay: Duration) {
        let events_tx = self.events_tx.clone();
        let state = &mut self.states[group];
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer = Some(spawn_task(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(DriverEvent::Tick(group));
        }));
    }

    fn record(&self, outcome: &Result<Response, TransactionError>) {
        match outcome {
            Ok(Response::Exception { .. }) | Err(_) => self.stats.record_error(),
            Ok(_) => self.stats.record_response(),
        }
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Tick(group) => {
                self.states[group].timer = None;
                self.issue(group);
            }
            DriverEvent::Completion {
                group,
                started,
                outcome,
            } => {
                self.record(&outcome);
                self.states[group].in_flight = false;
                self.engine.handle_outcome(group, outcome);
                let poll = &self.groups[group];
                let delay = match poll.kind {
                    GroupKind::Read => poll.interval.saturating_sub(started.elapsed()),
                    GroupKind::ReadWrite => poll.interval,
                };
                self.arm(group, delay);
            }
            DriverEvent::WriteDone { ack, outcome } => {
                self.record(&outcome);
                self.engine.complete_write(ack, outcome);
            }
        }
    }

    fn handle_set(&mut self, set: SetEvent) {
        match self.engine.handle_set(&set) {
            Ok(SetAction::Unchanged) => {
                log::debug!("{}/{} unchanged, no write issued", set.node_id, set.property_id);
            }
            Ok(SetAction::Deferred { group }) => {
                log::debug!(
                    "{}/{} queued for transaction {}",
                    set.node_id,
                    set.property_id,
                    self.groups[group].id
                );
                // An idle cycle is pulled forward; an in-flight one re-arms
                // with the updated buffer.
                if !self.states[group].in_flight {
                    if let Some(timer) = self.states[group].timer.take() {
                        timer.abort();
                    }
                    self.issue(group);
                }
            }
            Ok(SetAction::Write {
                group,
                request,
                ack,
            }) => {
                self.stats.record_request();
                let poll = self.groups[group].clone();
                let client = self.client.clone();
                let events_tx = self.events_tx.clone();
                spawn_task(async move {
                    let outcome = transact(
                        client.as_ref(),
                        poll.unit,
                        &request,
                        poll.timeout,
                        poll.max_retries,
                    )
                    .await;
                    let _ = events_tx.send(DriverEvent::WriteDone { ack, outcome });
                });
            }
            Err(err) => log::warn!("Rejected set: {err}"),
        }
    }
}
