//! labgrid-state: embedded persistence for the labgrid scheduler.
//!
//! Backed by [redb](https://docs.rs/redb). Holds labs, workflow
//! definitions, workflow runs, per-node job records and the latest device
//! properties reported by edges. Values are JSON in `&[u8]` columns; child
//! records use `{parent}:{child}` keys so a prefix scan lists them.
//!
//! `StateStore` is `Clone + Send + Sync` and shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
