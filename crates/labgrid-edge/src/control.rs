//! Replica-wide registry of edge sessions plus the job dispatchers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use labgrid_core::Outbound;
use labgrid_engine::Event;
use labgrid_state::LabStatus;

use crate::context::ControlContext;
use crate::dispatch;
use crate::error::{EdgeError, EdgeResult};
use crate::session::EdgeSession;

pub struct Control {
    ctx: ControlContext,
    sessions: RwLock<HashMap<String, Arc<EdgeSession>>>,
    cancel: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Control {
    pub fn new(ctx: ControlContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            dispatchers: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    /// Spawn the configured number of dispatchers. Idempotent.
    pub async fn start(&self) {
        let mut dispatchers = self.dispatchers.lock().await;
        if !dispatchers.is_empty() {
            return;
        }
        let count = self.ctx.config.queue.dispatchers.max(1);
        for worker in 0..count {
            dispatchers.push(dispatch::spawn_dispatcher(
                self.ctx.clone(),
                worker,
                self.cancel.child_token(),
            ));
        }
        info!(schedule_id = %self.ctx.schedule_id(), count, "job dispatchers started");
    }

    /// Authenticate an edge and make this connection the lab's owner.
    ///
    /// Fails without side effects when the lab is unknown, the credentials
    /// do not match, or another live connection owns the lab. The returned
    /// receiver carries every frame the session sends.
    pub async fn connect(
        self: &Arc<Self>,
        lab_uuid: &str,
        access_key: &str,
        access_secret: &str,
    ) -> EdgeResult<(Arc<EdgeSession>, mpsc::Receiver<Outbound>)> {
        let lab = self
            .ctx
            .store
            .get_lab(lab_uuid)?
            .ok_or_else(|| EdgeError::LabNotFound(lab_uuid.to_string()))?;
        if !lab.credentials_match(access_key, access_secret) {
            warn!(lab_uuid, "edge presented invalid credentials");
            return Err(EdgeError::Unauthorized(lab_uuid.to_string()));
        }

        let conn_id = Uuid::new_v4().to_string();
        self.ctx.ownership.claim(lab_uuid, &conn_id).await?;

        let (session, rx) = EdgeSession::new(lab, conn_id.clone(), self.ctx.clone());
        let stale = self
            .sessions
            .write()
            .await
            .insert(lab_uuid.to_string(), session.clone());
        if let Some(stale) = stale {
            info!(lab_uuid, stale_conn = %stale.conn_id(), "replacing stale session");
            stale.close().await;
        }

        session.start_heartbeat().await;
        if let Err(e) = self.ctx.affinity.add_user(lab_uuid).await {
            warn!(lab_uuid, error = %e, "failed to join owned set, dropping connection");
            self.disconnect(&session).await;
            return Err(e.into());
        }
        if let Err(e) = self.ctx.store.set_lab_status(lab_uuid, LabStatus::Online) {
            warn!(lab_uuid, error = %e, "failed to mark lab online");
        }
        self.ctx
            .notifier
            .notify(
                lab_uuid,
                Event::LabStatus {
                    lab_uuid: lab_uuid.to_string(),
                    status: LabStatus::Online,
                },
            )
            .await;

        self.watch(&session);
        info!(lab_uuid, conn_id = %conn_id, "edge session opened");
        Ok((session, rx))
    }

    /// Run the close path once the session's token fires, whoever fired it.
    fn watch(self: &Arc<Self>, session: &Arc<EdgeSession>) {
        let control: Weak<Self> = Arc::downgrade(self);
        let session = session.clone();
        tokio::spawn(async move {
            session.cancel_token().cancelled().await;
            if let Some(control) = control.upgrade() {
                control.disconnect(&session).await;
            }
        });
    }

    /// Remove the session if it is still the registered one, then close it.
    pub async fn disconnect(&self, session: &Arc<EdgeSession>) {
        {
            let mut sessions = self.sessions.write().await;
            let registered = sessions
                .get(session.lab_uuid())
                .is_some_and(|s| s.conn_id() == session.conn_id());
            if registered {
                sessions.remove(session.lab_uuid());
            }
        }
        session.close().await;
    }

    pub async fn session(&self, lab_uuid: &str) -> Option<Arc<EdgeSession>> {
        self.sessions.read().await.get(lab_uuid).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop dispatchers and close every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let dispatchers: Vec<_> = self.dispatchers.lock().await.drain(..).collect();
        for result in join_all(dispatchers).await {
            if let Err(e) = result {
                warn!(error = %e, "dispatcher panicked");
            }
        }
        let sessions: Vec<_> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        join_all(sessions.iter().map(|s| s.close())).await;
        info!(schedule_id = %self.ctx.schedule_id(), "control shut down");
    }
}
