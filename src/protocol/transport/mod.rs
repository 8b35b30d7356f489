/// Modbus transports
///
/// Each transport provides a master-side [`ModbusClient`] and a slave-side
/// `serve_*` loop around a shared [`SlaveService`]. Frames are built and
/// parsed by `rmodbus` (MBAP for sockets, RTU or ASCII for serial lines).
pub mod loopback;
pub mod serial;
pub mod tcp;
pub mod udp;

use anyhow::Result;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use crate::{
    api::modbus::{slave::SlaveService, traits::ModbusClient},
    cli::config::{Endpoint, TransportKind},
    protocol::modbus::{ClientFrame, Response, TransactionError},
};

pub use loopback::LoopbackClient;
pub use serial::{open_serial_port, SerialClient};
pub use tcp::TcpClient;
pub use udp::UdpClient;

/// Requests waiting for a response, keyed by MBAP transaction id.
#[derive(Default)]
pub struct PendingTransactions {
    waiting: Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>,
}

/// Removes its transaction id from the table when dropped, so timed-out
/// callers never leak entries.
pub struct PendingGuard {
    pending: Arc<PendingTransactions>,
    transaction_id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.waiting.lock().remove(&self.transaction_id);
    }
}

impl PendingTransactions {
    pub fn register(
        self: &Arc<Self>,
        transaction_id: u16,
    ) -> (PendingGuard, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(transaction_id, tx);
        (
            PendingGuard {
                pending: self.clone(),
                transaction_id,
            },
            rx,
        )
    }

    /// Hands the response `frame` to the waiting caller. Returns false for
    /// unknown ids.
    pub fn complete(&self, transaction_id: u16, frame: Vec<u8>) -> bool {
        match self.waiting.lock().remove(&transaction_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Drops every waiting sender; callers observe a closed channel.
    pub fn fail_all(&self) {
        self.waiting.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waits for the answer to `frame` and parses it.
pub(crate) async fn await_response(
    rx: oneshot::Receiver<Vec<u8>>,
    frame: &ClientFrame,
) -> Result<Response, TransactionError> {
    let reply = rx.await.map_err(|_| TransactionError::Closed)?;
    frame.parse(&reply)
}

/// Builds the master client for `endpoint`. Socket clients connect lazily.
pub async fn connect_client(
    endpoint: &Endpoint,
    concurrent_transactions: usize,
) -> Result<Arc<dyn ModbusClient>> {
    let client: Arc<dyn ModbusClient> = match endpoint {
        Endpoint::Socket(TransportKind::Udp, address) => {
            Arc::new(UdpClient::connect(address).await?)
        }
        Endpoint::Socket(_, address) => Arc::new(TcpClient::new(address, concurrent_transactions)),
        Endpoint::Serial(kind, options) => Arc::new(SerialClient::open(options, kind.proto())?),
    };
    Ok(client)
}

/// Serves `service` on `endpoint` until `shutdown` fires or is dropped.
pub async fn serve(
    endpoint: &Endpoint,
    service: Arc<SlaveService>,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    match endpoint {
        Endpoint::Socket(TransportKind::Udp, address) => {
            udp::serve_udp(address, service, shutdown).await
        }
        Endpoint::Socket(_, address) => tcp::serve_tcp(address, service, shutdown).await,
        Endpoint::Serial(kind, options) => {
            serial::serve_serial(options, kind.proto(), service, shutdown).await
        }
    }
}
