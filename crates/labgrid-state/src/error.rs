//! Error types for the labgrid state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures surfaced by [`crate::StateStore`]. redb's many error types are
/// flattened to strings at the boundary so callers match on the stage that
/// failed, not on the storage engine's internals.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state storage error: {0}")]
    Storage(String),

    #[error("state record codec error: {0}")]
    Codec(String),

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
}

impl StateError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StateError::NotFound {
            kind,
            key: key.into(),
        }
    }
}
