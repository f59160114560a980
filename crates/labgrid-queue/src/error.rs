//! Error types for the Redis backbone.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis connection unavailable: {0}")]
    Connection(String),

    /// The affinity script itself failed. Never conflated with "no message".
    #[error("affinity script failed: {0}")]
    Script(String),

    #[error("lab {0} is already owned by another connection")]
    OwnershipConflict(String),

    #[error("queue payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Connection(format!("{err:#}"))
    }
}
