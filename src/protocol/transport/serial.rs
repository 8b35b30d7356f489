use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    io::{Read, Write},
    sync::Arc,
    time::Duration,
};

use crate::{
    api::modbus::{slave::SlaveService, traits::ModbusClient},
    cli::config::SerialPortOptions,
    core::task_manager::{spawn_blocking_task, spawn_task},
    protocol::modbus::{
        adu::{self, MAX_ADU_LEN},
        rtu_crc_matches, rtu_request_len, ClientFrame, FrameLen, ModbusProto, Request, Response,
        TransactionError,
    },
};

type SerialHandle = Box<dyn serialport::SerialPort>;

/// Open a serial port with the configured line settings, enabling exclusive
/// access on Unix systems.
pub fn open_serial_port(options: &SerialPortOptions) -> Result<SerialHandle> {
    let port = options.path.as_str();
    let data_bits = match options.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => return Err(anyhow!("Unsupported data bits {other} for {port}")),
    };
    let stop_bits = match options.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => return Err(anyhow!("Unsupported stop bits {other} for {port}")),
    };
    let parity = match options.parity.to_ascii_lowercase().as_str() {
        "none" => serialport::Parity::None,
        "even" => serialport::Parity::Even,
        "odd" => serialport::Parity::Odd,
        other => return Err(anyhow!("Unsupported parity '{other}' for {port}")),
    };

    let builder = serialport::new(port, options.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .timeout(Duration::from_millis(options.timeout_ms));

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

fn mode(proto: ModbusProto) -> &'static str {
    match proto {
        ModbusProto::Ascii => "ASCII",
        _ => "RTU",
    }
}

/// Grows `frame` to `wanted` bytes. `Ok(false)` when the line stays silent
/// for the port timeout before the first byte.
fn fill<R: Read + ?Sized>(port: &mut R, frame: &mut Vec<u8>, wanted: usize) -> Result<bool> {
    while frame.len() < wanted {
        let mut chunk = vec![0u8; wanted - frame.len()];
        match port.read(&mut chunk) {
            Ok(0) => bail!("Serial port closed"),
            Ok(read) => frame.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                if frame.is_empty() {
                    return Ok(false);
                }
                bail!("Incomplete frame {frame:02X?}");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Reads one RTU request. Functions without a known layout end at the
/// first byte where the CRC checks.
fn read_rtu_request<R: Read + ?Sized>(port: &mut R) -> Result<Option<Vec<u8>>> {
    let mut frame = Vec::with_capacity(MAX_ADU_LEN);
    let mut wanted = 2;
    loop {
        if !fill(port, &mut frame, wanted)? {
            return Ok(None);
        }
        match rtu_request_len(&frame) {
            FrameLen::Complete(len) if len <= frame.len() => return Ok(Some(frame)),
            FrameLen::Complete(len) | FrameLen::NeedHeader(len) => wanted = len,
            FrameLen::UntilCrc => {
                if rtu_crc_matches(&frame) {
                    return Ok(Some(frame));
                }
                ensure!(frame.len() < 256, "No valid CRC within {} bytes", frame.len());
                wanted = frame.len() + 1;
            }
        }
    }
}

fn read_rtu_response<R: Read + ?Sized>(port: &mut R) -> Result<Option<Vec<u8>>> {
    let mut frame = Vec::with_capacity(MAX_ADU_LEN);
    if !fill(port, &mut frame, 3)? {
        return Ok(None);
    }
    let len = adu::serial_response_len(&frame, ModbusProto::Rtu)?;
    fill(port, &mut frame, len)?;
    Ok(Some(frame))
}

/// Reads one `:...\r\n` line, skipping noise before the colon.
fn read_ascii_line<R: Read + ?Sized>(port: &mut R) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::with_capacity(2 * MAX_ADU_LEN);
    let mut byte = [0u8; 1];
    loop {
        match port.read(&mut byte) {
            Ok(0) => bail!("Serial port closed"),
            Ok(_) => {
                match byte[0] {
                    b':' => line.clear(),
                    _ if line.is_empty() => continue,
                    _ => {}
                }
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(Some(line));
                }
                ensure!(line.len() <= 2 * 256 + 3, "ASCII frame too long");
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                if line.is_empty() {
                    return Ok(None);
                }
                bail!("Incomplete ASCII frame {:?}", String::from_utf8_lossy(&line));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Next request on the line as a binary frame.
fn read_request<R: Read + ?Sized>(port: &mut R, proto: ModbusProto) -> Result<Option<Vec<u8>>> {
    match proto {
        ModbusProto::Ascii => read_ascii_line(port)?
            .map(|line| adu::decode_ascii(&line))
            .transpose(),
        _ => read_rtu_request(port),
    }
}

fn read_response<R: Read + ?Sized>(port: &mut R, proto: ModbusProto) -> Result<Option<Vec<u8>>> {
    match proto {
        ModbusProto::Ascii => read_ascii_line(port)?
            .map(|line| adu::decode_ascii(&line))
            .transpose(),
        _ => read_rtu_response(port),
    }
}

/// Bytes put on the line for a binary frame.
fn line_bytes(proto: ModbusProto, frame: &[u8]) -> Result<Vec<u8>> {
    match proto {
        ModbusProto::Ascii => adu::encode_ascii(frame),
        _ => Ok(frame.to_vec()),
    }
}

/// Modbus RTU or ASCII master. The line is half duplex, so transactions
/// are serialized.
pub struct SerialClient {
    port: Arc<Mutex<SerialHandle>>,
    line: tokio::sync::Mutex<()>,
    proto: ModbusProto,
}

impl SerialClient {
    pub fn open(options: &SerialPortOptions, proto: ModbusProto) -> Result<Self> {
        let port = open_serial_port(options)?;
        log::info!(
            "Opened {} at {} baud for Modbus {}",
            options.path,
            options.baud_rate,
            mode(proto)
        );
        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            line: tokio::sync::Mutex::new(()),
            proto,
        })
    }
}

#[async_trait]
impl ModbusClient for SerialClient {
    async fn call(&self, unit: u8, request: &Request) -> Result<Response, TransactionError> {
        let _line = self.line.lock().await;
        let frame = ClientFrame::new(self.proto, unit, 0, request)?;
        let wire = line_bytes(self.proto, frame.bytes()).map_err(TransactionError::transport)?;
        let port = self.port.clone();
        let proto = self.proto;
        let exchange = spawn_blocking_task(move || -> Result<Option<Vec<u8>>> {
            let mut port = port.lock();
            port.clear(serialport::ClearBuffer::Input)?;
            port.write_all(&wire)?;
            port.flush()?;
            read_response(&mut **port, proto)
        });
        let reply = exchange
            .await
            .map_err(TransactionError::transport)?
            .map_err(TransactionError::transport)?
            .ok_or(TransactionError::Timeout)?;
        frame.parse(&reply)
    }
}

/// Serves `service` on a serial line in RTU or ASCII mode.
///
/// A blocking reader thread hands complete frames to an async task, which
/// answers them in arrival order. Broadcast frames are applied but never
/// answered.
pub async fn serve_serial(
    options: &SerialPortOptions,
    proto: ModbusProto,
    service: Arc<SlaveService>,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    let mut reader = open_serial_port(options)?;
    let writer = Arc::new(Mutex::new(reader.try_clone()?));
    log::info!(
        "Modbus {} slave listening on {} at {} baud",
        mode(proto),
        options.path,
        options.baud_rate
    );

    let (frame_tx, frame_rx) = flume::unbounded::<Vec<u8>>();
    let path = options.path.clone();
    let _reader = spawn_blocking_task(move || {
        while !frame_tx.is_disconnected() {
            match read_request(&mut *reader, proto) {
                Ok(Some(frame)) => {
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Discarding serial input on {path}: {err}");
                    let _ = reader.clear(serialport::ClearBuffer::Input);
                }
            }
        }
    });

    let responder = spawn_task(async move {
        while let Ok(frame) = frame_rx.recv_async().await {
            let Some(reply) = service.answer(proto, &frame).await else {
                continue;
            };
            let reply = match line_bytes(proto, &reply) {
                Ok(reply) => reply,
                Err(err) => {
                    log::warn!("{err}");
                    continue;
                }
            };
            let writer = writer.clone();
            let written = spawn_blocking_task(move || -> Result<()> {
                let mut port = writer.lock();
                port.write_all(&reply)?;
                port.flush()?;
                Ok(())
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("Failed to answer on serial line: {err}"),
                Err(err) => log::warn!("Serial writer task failed: {err}"),
            }
        }
    });

    let _ = shutdown.recv_async().await;
    log::info!("Modbus {} slave on {} shutting down", mode(proto), options.path);
    responder.abort();
    Ok(())
}
