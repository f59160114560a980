//! Affinity-routed consumer of the shared job queue.
//!
//! Every replica drains the same queue, but a message for lab L is only
//! handed to the replica whose owned-set contains L. Anything else is
//! pushed back for another replica. Ordering is best-effort: a message
//! that cycles through non-owning replicas can overtake or fall behind
//! other messages for the same lab.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use labgrid_core::config::QueueConfig;
use labgrid_core::keys::scheduler_users_set;
use labgrid_core::{JobMessage, epoch_secs};

use crate::backbone::{AffinityPop, Backbone};
use crate::error::QueueResult;

/// What one successful pop yielded.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    Job(JobMessage),
    /// Not valid JSON for a job message; returned verbatim.
    Malformed(String),
}

#[derive(Clone)]
pub struct AffinityQueue {
    backbone: Arc<dyn Backbone>,
    schedule_id: String,
    owned_set: String,
    retry_count: u32,
    expire: Duration,
    owned_set_ttl: Duration,
}

impl AffinityQueue {
    pub fn new(backbone: Arc<dyn Backbone>, schedule_id: impl Into<String>, config: &QueueConfig) -> Self {
        let schedule_id = schedule_id.into();
        Self {
            owned_set: scheduler_users_set(&schedule_id),
            backbone,
            schedule_id,
            retry_count: config.retry_count,
            expire: config.expire_timeout(),
            owned_set_ttl: config.owned_set_ttl(),
        }
    }

    /// Identifier of this replica.
    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    /// Try to claim one message from `queue` for a lab owned here.
    ///
    /// `Ok(None)` means nothing claimable right now; script failures are
    /// returned as errors.
    pub async fn consume_one(&self, queue: &str) -> QueueResult<Option<Consumed>> {
        let raw = self
            .backbone
            .affinity_pop(AffinityPop {
                queue,
                owned_set: &self.owned_set,
                retry_count: self.retry_count,
                expire_secs: self.expire.as_secs(),
                owned_set_ttl: self.owned_set_ttl,
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<JobMessage>(&raw) {
            Ok(msg) => {
                debug!(
                    task_uuid = %msg.task_uuid,
                    action = %msg.action,
                    attempt = msg.attempt_count.unwrap_or(0),
                    "claimed job message"
                );
                Ok(Some(Consumed::Job(msg)))
            }
            Err(err) => {
                warn!(error = %err, "malformed message on job queue");
                Ok(Some(Consumed::Malformed(raw)))
            }
        }
    }

    /// Whether a claimed message is past the expiry window.
    pub fn is_expired(&self, msg: &JobMessage) -> bool {
        msg.is_expired(epoch_secs(), self.expire.as_secs())
    }

    pub async fn push(&self, queue: &str, msg: &JobMessage) -> QueueResult<()> {
        let payload = serde_json::to_string(msg)?;
        self.backbone.lpush(queue, &payload).await
    }

    pub async fn add_user(&self, lab_uuid: &str) -> QueueResult<()> {
        self.backbone
            .sadd_with_ttl(&self.owned_set, lab_uuid, self.owned_set_ttl)
            .await
    }

    pub async fn remove_user(&self, lab_uuid: &str) -> QueueResult<()> {
        self.backbone.srem(&self.owned_set, lab_uuid).await
    }

    pub async fn has_user(&self, lab_uuid: &str) -> QueueResult<bool> {
        self.backbone.sismember(&self.owned_set, lab_uuid).await
    }
}
