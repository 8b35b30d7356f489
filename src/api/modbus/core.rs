use std::time::Duration;

use super::traits::ModbusClient;
use crate::protocol::modbus::{Request, Response, TransactionError};

/// Issues `request` with a per-attempt timeout, retrying transport failures
/// and timeouts up to `max_retries` times.
///
/// Exception responses are returned as-is; they are a valid answer.
pub async fn transact(
    client: &dyn ModbusClient,
    unit: u8,
    request: &Request,
    timeout: Duration,
    max_retries: u32,
) -> Result<Response, TransactionError> {
    let mut attempt = 0;
    loop {
        let error = match tokio::time::timeout(timeout, client.call(unit, request)).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => err,
            Err(_) => TransactionError::Timeout,
        };
        if attempt >= max_retries {
            return Err(error);
        }
        attempt += 1;
        log::debug!(
            "Unit {unit}: request {:#04x} failed ({error}), retry {attempt}/{max_retries}",
            request.function_code()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::protocol::modbus::{ExceptionCode, FunctionCode};

    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModbusClient for FlakyClient {
        async fn call(&self, _unit: u8, request: &Request) -> Result<Response, TransactionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransactionError::Closed);
            }
            match request {
                Request::ReadInputRegisters { .. } => Ok(Response::exception(
                    request,
                    ExceptionCode::IllegalDataAddress,
                )),
                _ => Ok(Response::Registers {
                    function: FunctionCode::ReadHoldingRegisters,
                    data: vec![0, 1],
                }),
            }
        }
    }

    fn read() -> Request {
        Request::ReadHoldingRegisters {
            address: 0,
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let client = FlakyClient {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let response = transact(&client, 1, &read(), Duration::from_millis(100), 2).await;
        assert!(response.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let client = FlakyClient {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let response = transact(&client, 1, &read(), Duration::from_millis(100), 3).await;
        assert_eq!(response, Err(TransactionError::Closed));
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exception_is_not_retried() {
        let client = FlakyClient {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let request = Request::ReadInputRegisters {
            address: 0,
            quantity: 1,
        };
        let response = transact(&client, 1, &request, Duration::from_millis(100), 5)
            .await
            .unwrap();
        assert!(matches!(response, Response::Exception { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    struct SilentClient;

    #[async_trait]
    impl ModbusClient for SilentClient {
        async fn call(&self, _unit: u8, _request: &Request) -> Result<Response, TransactionError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_silent_device_times_out() {
        let response = tokio_test::block_on(transact(
            &SilentClient,
            1,
            &read(),
            Duration::from_millis(20),
            1,
        ));
        assert_eq!(response, Err(TransactionError::Timeout));
    }
}
