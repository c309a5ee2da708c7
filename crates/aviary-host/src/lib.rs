//! Host side of the orchestrator: instance records, worker process
//! supervision, and the management operations the platform calls.

pub mod config_store;
pub mod error;
pub mod manager;
pub mod supervisor;

pub use error::HostError;
pub use manager::{InstanceRecord, Manager, PublicInstance};
