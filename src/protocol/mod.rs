pub mod modbus;
pub mod transport;
