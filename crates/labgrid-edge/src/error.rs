use thiserror::Error;

use labgrid_core::ProtocolError;
use labgrid_engine::EngineError;
use labgrid_queue::QueueError;
use labgrid_state::StateError;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("lab not found: {0}")]
    LabNotFound(String),

    #[error("invalid credentials for lab {0}")]
    Unauthorized(String),

    #[error("missing connection header: {0}")]
    MissingHeader(&'static str),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl EdgeError {
    /// Another connection already owns the lab.
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, EdgeError::Queue(QueueError::OwnershipConflict(_)))
    }
}

pub type EdgeResult<T> = Result<T, EdgeError>;
