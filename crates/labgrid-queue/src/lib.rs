//! labgrid-queue: the Redis backbone shared by all scheduler replicas.
//!
//! * [`Backbone`]: the handful of Redis operations labgrid uses, with a
//!   real ([`RedisBackbone`]) and an in-process ([`MemoryBackbone`]) backend.
//! * [`AffinityQueue`]: drains the shared job queue, claiming only
//!   messages for labs this replica owns.
//! * [`OwnershipTracker`]: the per-lab heart key acting as a distributed
//!   mutex over the edge connection.

pub mod affinity;
pub mod backbone;
pub mod connection;
pub mod error;
pub mod ownership;

pub use affinity::{AffinityQueue, Consumed};
pub use backbone::{AffinityPop, Backbone, MemoryBackbone, RedisBackbone};
pub use error::{QueueError, QueueResult};
pub use connection::{RedisConfig, RedisConnectionFactory};
pub use ownership::OwnershipTracker;
