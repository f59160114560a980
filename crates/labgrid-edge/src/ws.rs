//! WebSocket endpoint for edge controllers.
//!
//! Credentials travel in headers and are checked before the upgrade, so a
//! rejected edge gets a plain HTTP status instead of a socket that closes
//! immediately.

use std::fmt;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use labgrid_core::Outbound;

use crate::control::Control;
use crate::error::EdgeError;
use crate::session::EdgeSession;

pub const LAB_UUID_HEADER: &str = "x-lab-uuid";
pub const ACCESS_KEY_HEADER: &str = "x-access-key";
pub const ACCESS_SECRET_HEADER: &str = "x-access-secret";

pub const SCHEDULE_WS_PATH: &str = "/api/v1/ws/schedule";

pub fn ws_router(control: Arc<Control>) -> Router {
    Router::new()
        .route(SCHEDULE_WS_PATH, get(schedule_ws))
        .with_state(control)
}

struct Credentials {
    lab_uuid: String,
    access_key: String,
    access_secret: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, EdgeError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(EdgeError::MissingHeader(name))
}

fn credentials(headers: &HeaderMap) -> Result<Credentials, EdgeError> {
    Ok(Credentials {
        lab_uuid: header(headers, LAB_UUID_HEADER)?.to_string(),
        access_key: header(headers, ACCESS_KEY_HEADER)?.to_string(),
        access_secret: header(headers, ACCESS_SECRET_HEADER)?.to_string(),
    })
}

/// Status code for a refused connection.
pub fn rejection_status(err: &EdgeError) -> StatusCode {
    match err {
        EdgeError::MissingHeader(_) | EdgeError::Unauthorized(_) | EdgeError::LabNotFound(_) => {
            StatusCode::UNAUTHORIZED
        }
        e if e.is_ownership_conflict() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn schedule_ws(
    State(control): State<Arc<Control>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let connected = match credentials(&headers) {
        Ok(creds) => {
            control
                .connect(&creds.lab_uuid, &creds.access_key, &creds.access_secret)
                .await
        }
        Err(e) => Err(e),
    };
    let (session, rx) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "edge connection refused");
            return (rejection_status(&e), e.to_string()).into_response();
        }
    };

    let failed = (control.clone(), session.clone());
    ws.on_failed_upgrade(move |e| {
        warn!(error = %e, "websocket upgrade failed");
        let (control, session) = failed;
        tokio::spawn(async move { control.disconnect(&session).await });
    })
    .on_upgrade(move |socket| serve_socket(control, session, rx, socket))
}

/// Pump frames between the socket and the session until either side ends.
async fn serve_socket(
    control: Arc<Control>,
    session: Arc<EdgeSession>,
    rx: mpsc::Receiver<Outbound>,
    socket: WebSocket,
) {
    let (sink, mut stream) = socket.split();
    let cancel = session.cancel_token();

    let writer = tokio::spawn(write_frames(sink, rx, cancel.clone()));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(lab_uuid = %session.lab_uuid(), error = %e, "socket read failed");
                break;
            }
        }
    }

    control.disconnect(&session).await;
    if let Err(e) = writer.await {
        warn!(error = %e, "socket writer panicked");
    }
}

/// Single writer for the socket: drains the session's outbound channel
/// until it closes or the session is cancelled, then closes the sink.
async fn write_frames<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>, cancel: CancellationToken)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        let text = match msg.to_text() {
            Ok(t) => t,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "failed to encode outbound frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "socket write failed");
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "socket close failed");
    }
}
