//! In-memory action status slots.
//!
//! Each outstanding device exchange gets one slot keyed by [`ActionKey`]:
//! uninitialized → waiting (`free == false`, deadline set) → resolved
//! (device reported free, or the deadline passed). The owning engine polls
//! the slot; the inbound-message handler flips it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use labgrid_core::ActionKey;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionValue {
    pub free: bool,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct ActionStatusTable {
    slots: RwLock<HashMap<ActionKey, ActionValue>>,
}

impl ActionStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a slot as busy with a deadline `timeout` from now.
    pub async fn init(&self, key: ActionKey, timeout: Duration) {
        let value = ActionValue {
            free: false,
            deadline: Instant::now() + timeout,
        };
        self.slots.write().await.insert(key, value);
    }

    /// Update a slot from a device report. `extend_by` pushes the deadline
    /// out. Returns `false` when the key is unknown.
    pub async fn set(&self, key: &ActionKey, free: bool, extend_by: Duration) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(key) {
            Some(value) => {
                value.free = free;
                value.deadline += extend_by;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, key: &ActionKey) -> Option<ActionValue> {
        self.slots.read().await.get(key).copied()
    }

    pub async fn remove(&self, key: &ActionKey) -> Option<ActionValue> {
        self.slots.write().await.remove(key)
    }

    /// Poll until the slot is free, its deadline passes, or `cancel` fires.
    pub async fn wait_free(
        &self,
        key: &ActionKey,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        loop {
            let Some(value) = self.get(key).await else {
                return Err(EngineError::NotFound(format!("action slot {key}")));
            };
            if value.free {
                return Ok(());
            }
            if Instant::now() >= value.deadline {
                return Err(EngineError::Timeout(key.to_string()));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgrid_core::ActionKind;
    use std::sync::Arc;

    fn key() -> ActionKey {
        ActionKey {
            kind: ActionKind::QueryStatus,
            task_id: "t".into(),
            job_id: "j".into(),
            device_id: "arm".into(),
            action_name: "move".into(),
        }
    }

    #[tokio::test]
    async fn poller_observes_free() {
        let table = Arc::new(ActionStatusTable::new());
        table.init(key(), Duration::from_secs(5)).await;

        let poller = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .wait_free(&key(), Duration::from_millis(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.set(&key(), true, Duration::ZERO).await);

        let result = tokio::time::timeout(Duration::from_millis(200), poller)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let table = ActionStatusTable::new();
        table.init(key(), Duration::from_millis(20)).await;
        let err = table
            .wait_free(&key(), Duration::from_millis(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn extension_pushes_deadline() {
        let table = ActionStatusTable::new();
        table.init(key(), Duration::from_millis(10)).await;
        let before = table.get(&key()).await.unwrap().deadline;
        table.set(&key(), false, Duration::from_secs(30)).await;
        let after = table.get(&key()).await.unwrap();
        assert!(!after.free);
        assert_eq!(after.deadline, before + Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancel_unblocks_poller() {
        let table = ActionStatusTable::new();
        table.init(key(), Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = table
            .wait_free(&key(), Duration::from_millis(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn unknown_key_is_not_updated() {
        let table = ActionStatusTable::new();
        assert!(!table.set(&key(), true, Duration::ZERO).await);
        assert!(table.remove(&key()).await.is_none());
    }
}
