use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    api::modbus::{slave::SlaveService, traits::ModbusClient},
    protocol::modbus::{ClientFrame, ModbusProto, Request, Response, TransactionError},
};

/// In-process client that talks straight to a [`SlaveService`].
///
/// Requests are framed as RTU both ways so the exchange matches what a
/// serial line would deliver.
pub struct LoopbackClient {
    service: Arc<SlaveService>,
}

impl LoopbackClient {
    pub fn new(service: Arc<SlaveService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ModbusClient for LoopbackClient {
    async fn call(&self, unit: u8, request: &Request) -> Result<Response, TransactionError> {
        let frame = ClientFrame::new(ModbusProto::Rtu, unit, 0, request)?;
        let reply = self
            .service
            .answer(ModbusProto::Rtu, frame.bytes())
            .await
            .ok_or(TransactionError::Timeout)?;
        frame.parse(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::modbus::slave::SlaveStore,
        core::stats::Stats,
        protocol::modbus::{ExceptionCode, FunctionCode},
    };
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    fn service(delay: Option<Duration>) -> Arc<SlaveService> {
        let mut store = SlaveStore::new();
        store.unit(1);
        Arc::new(SlaveService::new(
            Arc::new(Mutex::new(store)),
            delay,
            Arc::new(Stats::default()),
        ))
    }

    #[tokio::test]
    async fn test_read_write_combined() {
        let client = LoopbackClient::new(service(None));
        let response = client
            .call(
                1,
                &Request::ReadWriteMultipleRegisters {
                    read_address: 0,
                    read_quantity: 2,
                    write_address: 1,
                    data: vec![0x12, 0x34],
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Registers {
                function: FunctionCode::ReadWriteMultipleRegisters,
                data: vec![0, 0, 0x12, 0x34]
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_unit_and_delay() {
        let service = service(Some(Duration::from_millis(60)));
        let client = LoopbackClient::new(service.clone());
        let started = Instant::now();
        let response = client
            .call(
                1,
                &Request::WriteSingleCoil {
                    address: 5,
                    value: true,
                },
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(
            response,
            Response::WriteSingleCoil {
                address: 5,
                value: true
            }
        );

        let response = client
            .call(
                2,
                &Request::ReadCoils {
                    address: 0,
                    quantity: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Exception {
                function: 0x01,
                code: ExceptionCode::IllegalDataAddress
            }
        );
        assert_eq!(service.stats().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_broadcast_gets_no_answer() {
        let service = service(None);
        let client = LoopbackClient::new(service.clone());
        let silent = client
            .call(
                0,
                &Request::WriteSingleRegister {
                    address: 9,
                    value: 5,
                },
            )
            .await;
        assert_eq!(silent, Err(TransactionError::Timeout));
        assert_eq!(
            service.store().lock().unit(1).holding_registers.peek(9),
            Some(crate::api::modbus::slave::CellValue::Word(5))
        );
    }
}
