//! Per-lab ownership key.
//!
//! Whichever connection creates `lab_heart_key_<uuid>` owns the lab. The
//! owner refreshes the key on a period strictly shorter than its TTL, so a
//! stalled or crashed replica loses ownership within one TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use labgrid_core::config::HeartbeatConfig;
use labgrid_core::keys::lab_heart_key;

use crate::affinity::AffinityQueue;
use crate::backbone::Backbone;
use crate::error::{QueueError, QueueResult};

#[derive(Clone)]
pub struct OwnershipTracker {
    backbone: Arc<dyn Backbone>,
    interval: Duration,
    ttl: Duration,
}

impl OwnershipTracker {
    pub fn new(backbone: Arc<dyn Backbone>, config: &HeartbeatConfig) -> Self {
        Self {
            backbone,
            interval: config.interval(),
            ttl: config.ttl(),
        }
    }

    pub fn with_timing(mut self, interval: Duration, ttl: Duration) -> Self {
        self.interval = interval;
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim the lab for `holder`. Fails with `OwnershipConflict` when the
    /// key already exists, whoever holds it.
    pub async fn claim(&self, lab_uuid: &str, holder: &str) -> QueueResult<()> {
        let created = self
            .backbone
            .set_nx_px(&lab_heart_key(lab_uuid), holder, self.ttl)
            .await?;
        if !created {
            return Err(QueueError::OwnershipConflict(lab_uuid.to_string()));
        }
        info!(lab_uuid, holder, "lab ownership claimed");
        Ok(())
    }

    /// Re-arm the key. Returns `false` when the key is gone or another
    /// holder has taken it. The check and the re-arm run as one atomic step.
    pub async fn refresh(&self, lab_uuid: &str, holder: &str) -> QueueResult<bool> {
        self.backbone
            .pexpire_if_eq(&lab_heart_key(lab_uuid), holder, self.ttl)
            .await
    }

    /// Drop the key if this holder still owns it.
    pub async fn release(&self, lab_uuid: &str, holder: &str) -> QueueResult<()> {
        if self
            .backbone
            .del_if_eq(&lab_heart_key(lab_uuid), holder)
            .await?
        {
            info!(lab_uuid, "lab ownership released");
        } else {
            debug!(lab_uuid, "ownership key not held by this connection, leaving it");
        }
        Ok(())
    }

    /// Current holder of the lab's key, if any.
    pub async fn holder(&self, lab_uuid: &str) -> QueueResult<Option<String>> {
        self.backbone.get(&lab_heart_key(lab_uuid)).await
    }

    pub async fn is_owned(&self, lab_uuid: &str) -> QueueResult<bool> {
        self.backbone.exists(&lab_heart_key(lab_uuid)).await
    }

    /// Refresh the key (and the lab's affinity membership) until `cancel`
    /// fires. Losing the key to another holder cancels `cancel`.
    pub fn spawn_heartbeat(
        &self,
        lab_uuid: String,
        holder: String,
        affinity: Option<AffinityQueue>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.interval);
            // The first tick completes immediately; the claim just set the key.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => {
                        debug!(lab_uuid = %lab_uuid, "heartbeat stopped");
                        return;
                    }
                }

                match tracker.refresh(&lab_uuid, &holder).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lab_uuid = %lab_uuid, "lab ownership lapsed or taken by another connection");
                        cancel.cancel();
                        return;
                    }
                    Err(e) => warn!(lab_uuid = %lab_uuid, error = %e, "heartbeat refresh failed"),
                }
                if let Some(affinity) = &affinity
                    && let Err(e) = affinity.add_user(&lab_uuid).await
                {
                    warn!(lab_uuid = %lab_uuid, error = %e, "owned-set refresh failed");
                }
            }
        })
    }
}
