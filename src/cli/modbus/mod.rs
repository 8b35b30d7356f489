pub mod master;
pub mod slave;

use std::collections::HashSet;

use crate::{api::modbus::traits::SetEvent, core::task_manager::spawn_task};

pub use master::{prepare_master, start_master, MasterHandle, MasterPlan};
pub use slave::{prepare_slave, start_slave, SlaveHandle, SlavePlan};

/// Splits one stream of set events between the slave and the master.
///
/// Events for nodes in `slave_nodes` go to the first receiver, everything
/// else to the second. The router stops when the source closes.
pub fn route_sets(
    source: flume::Receiver<SetEvent>,
    slave_nodes: HashSet<String>,
) -> (flume::Receiver<SetEvent>, flume::Receiver<SetEvent>) {
    let (slave_tx, slave_rx) = flume::unbounded();
    let (master_tx, master_rx) = flume::unbounded();
    spawn_task(async move {
        while let Ok(event) = source.recv_async().await {
            let target = if slave_nodes.contains(&event.node_id) {
                &slave_tx
            } else {
                &master_tx
            };
            if target.send(event).is_err() {
                log::debug!("Set event dropped, no receiver");
            }
        }
    });
    (slave_rx, master_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_sets() {
        let (tx, rx) = flume::unbounded();
        let (slave_rx, master_rx) = route_sets(rx, HashSet::from(["AO".to_string()]));
        for node in ["AO", "R0-AO"] {
            tx.send(SetEvent {
                node_id: node.to_string(),
                property_id: "x".to_string(),
                payload: "1".to_string(),
            })
            .unwrap();
        }
        assert_eq!(slave_rx.recv_async().await.unwrap().node_id, "AO");
        assert_eq!(master_rx.recv_async().await.unwrap().node_id, "R0-AO");
    }
}
