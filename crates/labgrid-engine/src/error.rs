//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The lab's socket is gone; the in-flight unit of work fails.
    #[error("edge connection closed")]
    ConnectionClosed,

    #[error("workflow graph has a cycle through node {0}")]
    CycleDetected(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("data serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or incomplete input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("device reported failure for {0}")]
    DeviceFailed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("task {0} is already running")]
    AlreadyRunning(String),

    /// The run was stopped, expired or finished before it started.
    #[error("task {0} is already settled")]
    AlreadySettled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),

    #[error("backbone error: {0}")]
    Queue(#[from] labgrid_queue::QueueError),
}

pub type EngineResult<T> = Result<T, EngineError>;
