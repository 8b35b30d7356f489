pub mod core;
pub mod master;
pub mod plan;
pub mod server;
pub mod slave;
pub mod traits;

// Re-export core traits (API layer - abstract interfaces)
pub use traits::{
    LoggingBridge, ModbusClient, NoOpBridge, PropertyBridge, Published, RecordingBridge, SetEvent,
};

pub use self::core::transact;
pub use master::{CachedValue, MasterEngine, SetAction, SetError, WriteAck};
pub use plan::{plan_requests, GroupKind, PollGroup, PropertyBinding};
pub use server::Served;
pub use slave::{
    apply_defaults, bind_slave_fields, CellValue, RegisterSpace, SlaveField, SlaveService,
    SlaveStore, UnitRegisters,
};
