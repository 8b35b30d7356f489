//! Public API: engine traits, the slave store and the master engine

pub mod modbus;

pub use modbus::*;
