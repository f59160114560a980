//! labgrid-core: shared vocabulary of the lab scheduler.
//!
//! Holds the config file model, the identifiers every crate passes
//! around (`WorkflowTaskKey`, `ActionKey`, `JobMessage`), the edge
//! WebSocket envelope and the Redis key namespaces.

pub mod config;
pub mod keys;
pub mod message;
pub mod types;

pub use config::{ConfigError, SchedulerConfig};
pub use message::{Envelope, Inbound, Outbound, ProtocolError};
pub use types::*;
