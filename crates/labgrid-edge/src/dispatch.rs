//! Job dispatchers: move messages from the shared job queue onto the
//! per-lab queues of labs this replica owns.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use labgrid_core::keys::{action_result_key, lab_control_queue, lab_task_queue};
use labgrid_core::{ActionResult, JobAction, JobMessage};
use labgrid_engine::Event;
use labgrid_queue::Consumed;
use labgrid_state::TaskStatus;

use crate::context::ControlContext;

pub(crate) fn spawn_dispatcher(
    ctx: ControlContext,
    worker: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move { run(ctx, worker, cancel).await })
}

async fn run(ctx: ControlContext, worker: usize, cancel: CancellationToken) {
    let queue = ctx.config.queue.job_queue.clone();
    let idle = ctx.config.queue.idle_backoff();
    let max = ctx.config.queue.max_backoff();
    let mut backoff = idle;
    debug!(worker, queue = %queue, "dispatcher started");

    // The pop script is not raced against cancellation; a message it has
    // already taken off the queue must be routed.
    while !cancel.is_cancelled() {
        match ctx.affinity.consume_one(&queue).await {
            Ok(Some(Consumed::Job(msg))) => {
                backoff = idle;
                route(&ctx, msg).await;
            }
            Ok(Some(Consumed::Malformed(raw))) => {
                backoff = idle;
                warn!(worker, bytes = raw.len(), "dropping malformed job message");
            }
            Ok(None) => pause(&cancel, idle).await,
            Err(e) => {
                error!(worker, error = %e, "job queue pop failed");
                pause(&cancel, backoff).await;
                backoff = (backoff * 2).min(max);
            }
        }
    }
    debug!(worker, "dispatcher stopped");
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Forward a claimed message to its lab's task or control queue.
pub(crate) async fn route(ctx: &ControlContext, msg: JobMessage) {
    if ctx.affinity.is_expired(&msg) {
        expire(ctx, &msg).await;
        return;
    }
    let Some(lab_uuid) = msg.lab_uuid.as_deref().filter(|l| !l.is_empty()) else {
        warn!(task_uuid = %msg.task_uuid, action = %msg.action, "dropping job message without lab_uuid");
        return;
    };
    let queue = if msg.action.is_control() {
        lab_control_queue(lab_uuid)
    } else {
        lab_task_queue(lab_uuid)
    };
    match ctx.affinity.push(&queue, &msg).await {
        Ok(()) => debug!(task_uuid = %msg.task_uuid, queue = %queue, "job routed to lab"),
        Err(e) => error!(task_uuid = %msg.task_uuid, queue = %queue, error = %e, "failed to route job"),
    }
}

/// Settle a message nobody claimed in time. Starts are marked failed so
/// callers are not left waiting; stop and status requests are dropped.
async fn expire(ctx: &ControlContext, msg: &JobMessage) {
    let reason = format!(
        "job expired after {}s without an owning scheduler",
        ctx.config.queue.expire_timeout_secs
    );
    warn!(task_uuid = %msg.task_uuid, action = %msg.action, "job message expired");
    let lab_uuid = msg.lab_uuid.as_deref().filter(|l| !l.is_empty());

    match msg.action {
        JobAction::StartAction => {
            let result = ActionResult::failed(msg.task_uuid.clone(), reason);
            match serde_json::to_string(&result) {
                Ok(payload) => {
                    if let Err(e) = ctx
                        .backbone
                        .set_px(
                            &action_result_key(&msg.task_uuid),
                            &payload,
                            ctx.config.engine.action_result_ttl(),
                        )
                        .await
                    {
                        warn!(task_uuid = %msg.task_uuid, error = %e, "failed to record expired action");
                    }
                }
                Err(e) => warn!(task_uuid = %msg.task_uuid, error = %e, "failed to encode action result"),
            }
            if let Some(lab_uuid) = lab_uuid {
                ctx.notifier
                    .notify(
                        lab_uuid,
                        Event::ActionResult {
                            task_uuid: msg.task_uuid.clone(),
                            success: false,
                        },
                    )
                    .await;
            }
        }
        JobAction::Start => {
            match ctx
                .store
                .update_task_status(&msg.task_uuid, TaskStatus::Failed, Some(reason.clone()))
            {
                Ok(Some(_)) => {
                    if let Some(lab_uuid) = lab_uuid {
                        ctx.notifier
                            .notify(
                                lab_uuid,
                                Event::TaskStatus {
                                    task_uuid: msg.task_uuid.clone(),
                                    status: TaskStatus::Failed,
                                    error: Some(reason),
                                },
                            )
                            .await;
                    }
                }
                Ok(None) => debug!(task_uuid = %msg.task_uuid, "expired start has no task record"),
                Err(e) => warn!(task_uuid = %msg.task_uuid, error = %e, "failed to fail expired task"),
            }
        }
        JobAction::Stop | JobAction::Status => {}
    }
}
