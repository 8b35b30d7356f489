use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::Semaphore,
    task::JoinHandle,
};

use super::{await_response, PendingTransactions};
use crate::{
    api::modbus::{slave::SlaveService, traits::ModbusClient},
    core::task_manager::spawn_task,
    protocol::modbus::{
        adu::{mbap_frame_len, transaction_id, MBAP_PREFIX_LEN},
        ClientFrame, ModbusProto, Request, Response, TransactionError,
    },
};

/// How long a client IP stays refused once it went over the limit.
pub const OVERFLOW_BAN: Duration = Duration::from_secs(10);

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Modbus TCP master. Transactions are multiplexed over one connection and
/// matched to responses by MBAP transaction id.
pub struct TcpClient {
    address: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
    pending: Arc<PendingTransactions>,
    permits: Semaphore,
    next_transaction: AtomicU16,
}

impl TcpClient {
    pub fn new(address: &str, concurrent_transactions: usize) -> Self {
        Self {
            address: address.to_string(),
            connection: tokio::sync::Mutex::new(None),
            pending: Arc::new(PendingTransactions::default()),
            permits: Semaphore::new(concurrent_transactions.max(1)),
            next_transaction: AtomicU16::new(1),
        }
    }

    async fn connect(&self) -> Result<Connection, TransactionError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(TransactionError::transport)?;
        stream.set_nodelay(true).map_err(TransactionError::transport)?;
        log::info!("Connected to Modbus TCP slave at {}", self.address);
        let (mut reader, writer) = stream.into_split();
        let pending = self.pending.clone();
        let address = self.address.clone();
        let reader = spawn_task(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Ok(frame)) => {
                        let id = transaction_id(&frame).unwrap_or_default();
                        if !pending.complete(id, frame) {
                            log::debug!("Dropping response for unknown transaction {id}");
                        }
                    }
                    Ok(Err(err)) => {
                        log::warn!("Connection to {address} lost: {err}");
                        pending.fail_all();
                        break;
                    }
                    Err(err) => {
                        log::warn!("Connection to {address} lost: {err}");
                        pending.fail_all();
                        break;
                    }
                }
            }
        });
        Ok(Connection { writer, reader })
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.reader.abort();
        }
    }
}

#[async_trait]
impl ModbusClient for TcpClient {
    async fn call(&self, unit: u8, request: &Request) -> Result<Response, TransactionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransactionError::Closed)?;
        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::new(ModbusProto::TcpUdp, unit, transaction_id, request)?;
        let (_guard, rx) = self.pending.register(transaction_id);
        {
            let mut connection = self.connection.lock().await;
            if connection
                .as_ref()
                .is_some_and(|connection| connection.reader.is_finished())
            {
                *connection = None;
            }
            if connection.is_none() {
                *connection = Some(self.connect().await?);
            }
            let Some(active) = connection.as_mut() else {
                return Err(TransactionError::Closed);
            };
            if let Err(err) = active.writer.write_all(frame.bytes()).await {
                if let Some(dead) = connection.take() {
                    dead.reader.abort();
                }
                return Err(TransactionError::transport(err));
            }
        }
        await_response(rx, &frame).await
    }
}

/// Reads one MBAP frame. The outer error is a dead stream; the inner one a
/// prefix that does not describe a frame, whose six bytes are consumed.
async fn read_frame<R>(reader: &mut R) -> std::io::Result<Result<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let mut frame = vec![0u8; MBAP_PREFIX_LEN];
    reader.read_exact(&mut frame).await?;
    let len = match mbap_frame_len(&frame) {
        Ok(len) => len,
        Err(err) => return Ok(Err(err)),
    };
    frame.resize(len, 0);
    reader.read_exact(&mut frame[MBAP_PREFIX_LEN..]).await?;
    Ok(Ok(frame))
}

/// Counts malformed headers per client IP and refuses clients that went
/// over the limit until their ban expires.
pub struct OverflowBans {
    limit: Option<u32>,
    ban: Duration,
    counts: Arc<Mutex<HashMap<IpAddr, u32>>>,
}

impl OverflowBans {
    pub fn new(limit: Option<u32>, ban: Duration) -> Self {
        Self {
            limit,
            ban,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn over_limit(&self, count: u32) -> bool {
        self.limit.is_some_and(|limit| count > limit)
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let count = self.counts.lock().get(&ip).copied().unwrap_or_default();
        self.over_limit(count)
    }

    /// Records one overflow; true when `ip` is now over the limit.
    pub fn record(&self, ip: IpAddr) -> bool {
        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(ip).or_default();
            *count += 1;
            *count
        };
        self.over_limit(count)
    }

    /// Forgets `ip` once the ban duration has passed.
    pub fn expire(&self, ip: IpAddr) {
        let counts = self.counts.clone();
        let ban = self.ban;
        spawn_task(async move {
            tokio::time::sleep(ban).await;
            counts.lock().remove(&ip);
        });
    }
}

/// Accepts Modbus TCP connections and answers from `service`.
pub async fn serve_tcp(
    address: &str,
    service: Arc<SlaveService>,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    let bans = Arc::new(OverflowBans::new(service.max_buffer_overflows(), OVERFLOW_BAN));
    serve_tcp_with(address, service, bans, shutdown).await
}

async fn serve_tcp_with(
    address: &str,
    service: Arc<SlaveService>,
    bans: Arc<OverflowBans>,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|err| anyhow!("Failed to bind Modbus TCP slave to {address}: {err}"))?;
    log::info!("Modbus TCP slave listening on {}", listener.local_addr()?);
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("Failed to accept Modbus TCP connection: {err}");
                        continue;
                    }
                };
                if bans.is_banned(peer.ip()) {
                    log::warn!("Refusing {peer}: too many buffer overflows");
                    bans.expire(peer.ip());
                    drop(stream);
                    continue;
                }
                log::info!("Modbus TCP master connected from {peer}");
                service.stats().reset();
                connections.retain(|handle: &JoinHandle<()>| !handle.is_finished());
                connections.push(spawn_task(serve_connection(
                    stream,
                    peer,
                    service.clone(),
                    bans.clone(),
                )));
            }
            _ = shutdown.recv_async() => {
                log::info!("Modbus TCP slave on {address} shutting down");
                break;
            }
        }
    }
    for handle in connections {
        handle.abort();
    }
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<SlaveService>,
    bans: Arc<OverflowBans>,
) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                service.stats().record_error();
                log::warn!("Buffer overflow from {peer}: {err}");
                if bans.record(peer.ip()) {
                    log::warn!("Disconnecting {peer}: too many buffer overflows");
                    bans.expire(peer.ip());
                    return;
                }
                continue;
            }
            Err(err) => {
                log::info!("Modbus TCP master {peer} disconnected: {err}");
                return;
            }
        };
        let Some(reply) = service.answer(ModbusProto::TcpUdp, &frame).await else {
            continue;
        };
        if let Err(err) = writer.write_all(&reply).await {
            log::warn!("Failed to answer {peer}: {err}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::modbus::slave::SlaveStore, core::stats::Stats, protocol::modbus::FunctionCode,
    };

    fn service() -> Arc<SlaveService> {
        let mut store = SlaveStore::new();
        store.unit(1);
        Arc::new(SlaveService::new(
            Arc::new(Mutex::new(store)),
            None,
            Arc::new(Stats::default()),
        ))
    }

    async fn free_address() -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(listener.local_addr()?.to_string())
    }

    #[tokio::test]
    async fn test_tcp_round_trip() -> Result<()> {
        let service = service();
        let address = free_address().await?;

        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let server = {
            let address = address.clone();
            let service = service.clone();
            spawn_task(async move {
                if let Err(err) = serve_tcp(&address, service, shutdown_rx).await {
                    log::error!("{err}");
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = TcpClient::new(&address, 4);
        let write = client
            .call(
                1,
                &Request::WriteSingleRegister {
                    address: 3,
                    value: 0xBEEF,
                },
            )
            .await?;
        assert_eq!(
            write,
            Response::WriteSingleRegister {
                address: 3,
                value: 0xBEEF
            }
        );
        let read = client
            .call(
                1,
                &Request::ReadHoldingRegisters {
                    address: 3,
                    quantity: 1,
                },
            )
            .await?;
        assert_eq!(
            read,
            Response::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                data: vec![0xBE, 0xEF]
            }
        );
        let unknown = client
            .call(
                9,
                &Request::ReadCoils {
                    address: 0,
                    quantity: 1,
                },
            )
            .await?;
        assert!(matches!(unknown, Response::Exception { function: 0x01, .. }));

        shutdown_tx.send(())?;
        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_overflowing_client_is_banned() -> Result<()> {
        let service = service();
        let address = free_address().await?;
        let bans = Arc::new(OverflowBans::new(Some(1), Duration::from_millis(300)));

        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let server = {
            let address = address.clone();
            let bans = bans.clone();
            spawn_task(async move {
                if let Err(err) = serve_tcp_with(&address, service, bans, shutdown_rx).await {
                    log::error!("{err}");
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let garbage = [0x00, 0x01, 0x00, 0x07, 0x00, 0x06];
        let mut stream = TcpStream::connect(&address).await?;
        stream.write_all(&garbage).await?;
        stream.write_all(&garbage).await?;
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        assert!(bans.is_banned("127.0.0.1".parse()?));

        let mut refused = TcpStream::connect(&address).await?;
        assert_eq!(refused.read(&mut buf).await.unwrap_or(0), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!bans.is_banned("127.0.0.1".parse()?));
        let client = TcpClient::new(&address, 1);
        let read = client
            .call(
                1,
                &Request::ReadCoils {
                    address: 0,
                    quantity: 1,
                },
            )
            .await?;
        assert!(matches!(read, Response::Bits { .. }));

        shutdown_tx.send(())?;
        server.await?;
        Ok(())
    }

    #[test]
    fn test_unlimited_overflows_never_ban() {
        let bans = OverflowBans::new(None, OVERFLOW_BAN);
        let ip = IpAddr::from([10, 0, 0, 1]);
        for _ in 0..1000 {
            assert!(!bans.record(ip));
        }
        assert!(!bans.is_banned(ip));
    }
}
