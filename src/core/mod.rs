/// Runtime plumbing shared by the slave and master drivers
pub mod stats;
pub mod task_manager;

pub use stats::{Stats, StatsSnapshot};
