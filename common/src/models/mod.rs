//! Shared data models.

pub mod connection;
pub mod payload;

// Re-export commonly used types
pub use connection::{Driver, InstanceConnectionName, IpType};
pub use payload::{PayloadRow, PayloadValue, PAYLOAD_PREAMBLE, PAYLOAD_QUERY};
