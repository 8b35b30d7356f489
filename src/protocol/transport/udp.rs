use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};
use tokio::{net::UdpSocket, task::JoinHandle};

use super::{await_response, PendingTransactions};
use crate::{
    api::modbus::{slave::SlaveService, traits::ModbusClient},
    core::task_manager::spawn_task,
    protocol::modbus::{
        adu::{self, MAX_ADU_LEN},
        ClientFrame, ModbusProto, Request, Response, TransactionError,
    },
};

/// Modbus UDP master, one MBAP frame per datagram.
pub struct UdpClient {
    socket: Arc<UdpSocket>,
    pending: Arc<PendingTransactions>,
    next_transaction: AtomicU16,
    reader: JoinHandle<()>,
}

impl UdpClient {
    pub async fn connect(address: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(address)
            .await
            .map_err(|err| anyhow!("Failed to target Modbus UDP slave {address}: {err}"))?;
        let socket = Arc::new(socket);
        let pending = Arc::new(PendingTransactions::default());
        let reader = {
            let socket = socket.clone();
            let pending = pending.clone();
            spawn_task(async move {
                let mut datagram = [0u8; MAX_ADU_LEN];
                loop {
                    let len = match socket.recv(&mut datagram).await {
                        Ok(len) => len,
                        Err(err) => {
                            // ICMP port unreachable surfaces here; keep listening
                            log::debug!("Modbus UDP receive failed: {err}");
                            continue;
                        }
                    };
                    match checked_datagram(&datagram[..len]) {
                        Ok((id, frame)) => {
                            pending.complete(id, frame.to_vec());
                        }
                        Err(err) => log::warn!("Discarding malformed Modbus UDP datagram: {err}"),
                    }
                }
            })
        };
        Ok(Self {
            socket,
            pending,
            next_transaction: AtomicU16::new(1),
            reader,
        })
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ModbusClient for UdpClient {
    async fn call(&self, unit: u8, request: &Request) -> Result<Response, TransactionError> {
        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::new(ModbusProto::TcpUdp, unit, transaction_id, request)?;
        let (_guard, rx) = self.pending.register(transaction_id);
        self.socket
            .send(frame.bytes())
            .await
            .map_err(TransactionError::transport)?;
        await_response(rx, &frame).await
    }
}

/// Transaction id and the MBAP frame a datagram carries, trailing bytes
/// cut off.
fn checked_datagram(datagram: &[u8]) -> Result<(u16, &[u8])> {
    let len = adu::mbap_frame_len(datagram)?;
    let frame = datagram
        .get(..len)
        .ok_or_else(|| anyhow!("datagram shorter than its MBAP length"))?;
    let id = adu::transaction_id(frame).unwrap_or_default();
    Ok((id, frame))
}

/// Answers Modbus UDP datagrams from `service`. Each request is handled in
/// its own task so a configured delay never holds up other masters.
pub async fn serve_udp(
    address: &str,
    service: Arc<SlaveService>,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(address)
            .await
            .map_err(|err| anyhow!("Failed to bind Modbus UDP slave to {address}: {err}"))?,
    );
    log::info!("Modbus UDP slave listening on {}", socket.local_addr()?);
    let mut datagram = [0u8; MAX_ADU_LEN];
    loop {
        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut datagram) => match received {
                Ok(received) => received,
                Err(err) => {
                    log::debug!("Modbus UDP receive failed: {err}");
                    continue;
                }
            },
            _ = shutdown.recv_async() => {
                log::info!("Modbus UDP slave on {address} shutting down");
                return Ok(());
            }
        };
        let frame = match checked_datagram(&datagram[..len]) {
            Ok((_, frame)) => frame.to_vec(),
            Err(err) => {
                service.stats().record_error();
                log::warn!("Discarding malformed datagram from {peer}: {err}");
                continue;
            }
        };
        let socket = socket.clone();
        let service = service.clone();
        spawn_task(async move {
            let Some(reply) = service.answer(ModbusProto::TcpUdp, &frame).await else {
                return;
            };
            if let Err(err) = socket.send_to(&reply, peer).await {
                log::warn!("Failed to answer {peer}: {err}");
            }
        });
    }
}
