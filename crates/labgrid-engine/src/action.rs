//! Action engine: one ad-hoc device action, outside any workflow.
//!
//! Strictly ordered: load the stashed request, ask the device whether the
//! action is available, dispatch it, then wait for the completion
//! callback. Each wait polls an [`ActionStatusTable`] slot with its own
//! deadline. The terminal outcome is written to the result key whatever
//! happened, so the API can answer "fetch result" asynchronously.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use labgrid_core::config::EngineConfig;
use labgrid_core::keys::{action_request_key, action_result_key};
use labgrid_core::message::{
    CancelTask, DeviceJobStatus, DispatchAction, JobStatus as EdgeJobStatus, QueryActionStatus,
    ReportActionState, ServerInfo,
};
use labgrid_core::{ActionKey, ActionKind, ActionRequest, ActionResult, Outbound, epoch_secs};
use labgrid_queue::Backbone;

use crate::error::{EngineError, EngineResult};
use crate::notify::{Event, Notifier};
use crate::sender::{EdgeSender, SendClock};
use crate::status::ActionStatusTable;
use crate::task::{Task, WorkflowInfo};

pub struct ActionEngine {
    info: WorkflowInfo,
    backbone: Arc<dyn Backbone>,
    sender: Arc<dyn EdgeSender>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    clock: Arc<SendClock>,
    statuses: ActionStatusTable,
    request: RwLock<Option<ActionRequest>>,
    /// Terminal `job_status` from the device, once received.
    outcome: RwLock<Option<EdgeJobStatus>>,
}

impl ActionEngine {
    pub fn new(
        info: WorkflowInfo,
        backbone: Arc<dyn Backbone>,
        sender: Arc<dyn EdgeSender>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            info,
            backbone,
            sender,
            notifier,
            config,
            clock: Arc::new(SendClock::new()),
            statuses: ActionStatusTable::new(),
            request: RwLock::new(None),
            outcome: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<SendClock>) -> Self {
        self.clock = clock;
        self
    }

    fn action_key(req: &ActionRequest, kind: ActionKind) -> ActionKey {
        ActionKey {
            kind,
            task_id: req.task_uuid.clone(),
            job_id: req.job_id.clone(),
            device_id: req.device_id.clone(),
            action_name: req.action_name.clone(),
        }
    }

    /// Fetch and validate the request the API stashed for this task.
    async fn load_data(&self) -> EngineResult<ActionRequest> {
        let key = action_request_key(&self.info.task_uuid);
        let raw = self
            .backbone
            .get(&key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("action request {}", self.info.task_uuid)))?;
        let req: ActionRequest = serde_json::from_str(&raw)?;

        if req.task_uuid != self.info.task_uuid {
            return Err(EngineError::Validation(format!(
                "request under {key} is for task {}",
                req.task_uuid
            )));
        }
        let missing = req.missing_fields();
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "action request missing {}",
                missing.join(", ")
            )));
        }
        *self.request.write().await = Some(req.clone());
        Ok(req)
    }

    /// Ask the device whether the action can run now and wait for the answer.
    async fn query_action(&self, req: &ActionRequest, cancel: &CancellationToken) -> EngineResult<()> {
        let key = Self::action_key(req, ActionKind::QueryStatus);
        self.statuses
            .init(key.clone(), self.config.action_query_timeout())
            .await;
        self.sender
            .send(Outbound::QueryActionStatus(QueryActionStatus {
                task_id: req.task_uuid.clone(),
                job_id: req.job_id.clone(),
                device_id: req.device_id.clone(),
                action_name: req.action_name.clone(),
            }))
            .await?;

        let waited = self
            .statuses
            .wait_free(&key, self.config.action_poll_interval(), cancel)
            .await;
        self.statuses.remove(&key).await;
        waited
    }

    async fn send_action(&self, req: &ActionRequest) -> EngineResult<()> {
        // Armed before sending so an immediate reply is not lost.
        self.statuses
            .init(
                Self::action_key(req, ActionKind::Callback),
                self.config.action_callback_timeout(),
            )
            .await;
        let msg = Outbound::Dispatch(DispatchAction {
            task_id: req.task_uuid.clone(),
            job_id: req.job_id.clone(),
            node_id: String::new(),
            device_id: req.device_id.clone(),
            action: req.action_name.clone(),
            action_type: req.action_type.clone(),
            action_args: req.action_args.clone(),
            server_info: ServerInfo {
                send_timestamp: self.clock.next(),
            },
        });
        msg.to_envelope()?;
        self.sender.send(msg).await?;
        info!(
            task_uuid = %req.task_uuid,
            device_id = %req.device_id,
            action = %req.action_name,
            "action dispatched"
        );
        Ok(())
    }

    async fn callback_action(&self, req: &ActionRequest, cancel: &CancellationToken) -> EngineResult<()> {
        let key = Self::action_key(req, ActionKind::Callback);
        let waited = self
            .statuses
            .wait_free(&key, self.config.action_poll_interval(), cancel)
            .await;
        self.statuses.remove(&key).await;
        waited
    }

    async fn execute(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let req = self.load_data().await?;
        self.query_action(&req, cancel).await?;
        self.send_action(&req).await?;
        self.callback_action(&req, cancel).await
    }

    /// Turn the run outcome into the stored result.
    async fn record_result(&self, run: &EngineResult<()>) -> EngineResult<()> {
        let outcome = self.outcome.read().await.clone();
        let mut result = ActionResult {
            task_uuid: self.info.task_uuid.clone(),
            success: false,
            status: None,
            return_info: Value::Null,
            error: None,
            finished_at: epoch_secs(),
        };
        if let Some(o) = &outcome {
            result.status = serde_json::to_value(o.status)?.as_str().map(str::to_string);
            result.return_info = o.return_info.clone();
        }

        let verdict = match (run, &outcome) {
            (Err(e), _) => Err(e.to_string()),
            (Ok(()), Some(o)) if o.status == DeviceJobStatus::Success => Ok(()),
            (Ok(()), Some(_)) => Err("device reported failure".to_string()),
            (Ok(()), None) => Err("no terminal callback received".to_string()),
        };
        result.success = verdict.is_ok();
        result.error = verdict.err();

        self.backbone
            .set_px(
                &action_result_key(&self.info.task_uuid),
                &serde_json::to_string(&result)?,
                self.config.action_result_ttl(),
            )
            .await?;
        self.notifier
            .notify(
                &self.info.lab_uuid,
                Event::ActionResult {
                    task_uuid: self.info.task_uuid.clone(),
                    success: result.success,
                },
            )
            .await;

        if result.success {
            Ok(())
        } else {
            match run {
                Err(_) => Ok(()),
                Ok(()) => Err(EngineError::DeviceFailed(self.info.task_uuid.clone())),
            }
        }
    }

    async fn matches_job(&self, task_id: &str, job_id: &str) -> bool {
        if task_id != self.info.task_uuid {
            return false;
        }
        match self.request.read().await.as_ref() {
            Some(req) => req.job_id == job_id,
            None => true,
        }
    }
}

#[async_trait]
impl Task for ActionEngine {
    fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    async fn run(&self, cancel: CancellationToken) -> EngineResult<()> {
        info!(task_uuid = %self.info.task_uuid, lab_uuid = %self.info.lab_uuid, "action run starting");
        let run = self.execute(&cancel).await;

        if matches!(run, Err(EngineError::Cancelled)) {
            let job_id = self.request.read().await.as_ref().map(|r| r.job_id.clone());
            let cancel_msg = Outbound::CancelTask(CancelTask {
                task_id: self.info.task_uuid.clone(),
                job_id,
            });
            if let Err(e) = self.sender.send(cancel_msg).await {
                debug!(task_uuid = %self.info.task_uuid, error = %e, "cancel_task not delivered");
            }
        }

        if let Err(e) = self.record_result(&run).await {
            match &run {
                Ok(()) => {
                    warn!(task_uuid = %self.info.task_uuid, error = %e, "action finished unsuccessfully");
                    return Err(e);
                }
                Err(_) => warn!(task_uuid = %self.info.task_uuid, error = %e, "failed to store action result"),
            }
        }
        match &run {
            Ok(()) => info!(task_uuid = %self.info.task_uuid, "action run succeeded"),
            Err(e) => warn!(task_uuid = %self.info.task_uuid, error = %e, "action run failed"),
        }
        run
    }

    async fn on_job_status(&self, status: &EdgeJobStatus) {
        if !self.matches_job(&status.task_id, &status.job_id).await {
            return;
        }
        if !status.status.is_terminal() {
            debug!(task_uuid = %status.task_id, status = ?status.status, "action progress");
            return;
        }
        *self.outcome.write().await = Some(status.clone());
        let request = self.request.read().await.clone();
        if let Some(req) = request {
            let key = Self::action_key(&req, ActionKind::Callback);
            self.statuses.set(&key, true, Duration::ZERO).await;
        }
    }

    async fn on_action_state(&self, report: &ReportActionState) {
        if !self.matches_job(&report.task_id, &report.job_id).await {
            return;
        }
        let key = ActionKey {
            kind: report.kind,
            task_id: report.task_id.clone(),
            job_id: report.job_id.clone(),
            device_id: report.device_id.clone(),
            action_name: report.action_name.clone(),
        };
        let extend_by = Duration::from_secs(report.need_more_seconds);
        if !self.statuses.set(&key, report.free, extend_by).await {
            debug!(key = %key, "action state for an unknown slot");
        }
    }
}
