//! Status fan-out to web clients.
//!
//! Events are published on `lab_notify_<lab_uuid>`. Delivery is best
//! effort: a failed publish is logged, never propagated into the engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use labgrid_core::keys::lab_notify_channel;
use labgrid_queue::Backbone;
use labgrid_state::{JobStatus, LabStatus, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TaskStatus {
        task_uuid: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NodeStatus {
        task_uuid: String,
        node_uuid: String,
        status: JobStatus,
    },
    DeviceStatus {
        device_id: String,
        property_name: String,
        status: Value,
        timestamp: f64,
    },
    LabStatus {
        lab_uuid: String,
        status: LabStatus,
    },
    ActionResult {
        task_uuid: String,
        success: bool,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, lab_uuid: &str, event: Event);
}

pub struct BackboneNotifier {
    backbone: Arc<dyn Backbone>,
}

impl BackboneNotifier {
    pub fn new(backbone: Arc<dyn Backbone>) -> Self {
        Self { backbone }
    }
}

#[async_trait]
impl Notifier for BackboneNotifier {
    async fn notify(&self, lab_uuid: &str, event: Event) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(lab_uuid, error = %e, "failed to encode notification");
                return;
            }
        };
        if let Err(e) = self
            .backbone
            .publish(&lab_notify_channel(lab_uuid), &payload)
            .await
        {
            warn!(lab_uuid, error = %e, "failed to publish notification");
        }
    }
}
