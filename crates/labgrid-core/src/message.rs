//! WebSocket envelope exchanged with edge controllers.
//!
//! Both directions use `{"action": <kind>, "data": <payload>}`. Inbound
//! text is parsed in two steps (envelope, then payload by kind) so an
//! unknown kind or a bad payload is reported precisely instead of as a
//! generic decode failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::ActionKind;

/// Action names on the wire.
pub mod kind {
    // scheduler → edge
    pub const JOB_START: &str = "job_start";
    pub const QUERY_ACTION_STATUS: &str = "query_action_status";
    pub const PONG: &str = "pong";
    pub const CANCEL_TASK: &str = "cancel_task";
    pub const MATERIAL: &str = "material";
    pub const ERROR: &str = "error";

    // edge → scheduler
    pub const JOB_STATUS: &str = "job_status";
    pub const DEVICE_STATUS: &str = "device_status";
    pub const PING: &str = "ping";
    pub const REPORT_ACTION_STATE: &str = "report_action_state";
    pub const HOST_READY: &str = "host_ready";
    pub const NORMAL_EXIT: &str = "normal_exit";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid payload for {action}: {source}")]
    InvalidPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw `{action, data}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

// ── scheduler → edge payloads ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub send_timestamp: f64,
}

/// Ask the edge to run one device action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAction {
    pub task_id: String,
    pub job_id: String,
    #[serde(default)]
    pub node_id: String,
    pub device_id: String,
    pub action: String,
    pub action_type: String,
    #[serde(default)]
    pub action_args: Value,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryActionStatus {
    pub task_id: String,
    pub job_id: String,
    pub device_id: String,
    pub action_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub ping_id: String,
    pub client_timestamp: f64,
    pub server_timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelTask {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

// ── edge → scheduler payloads ──────────────────────────────────────

/// Status of a job as reported by the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceJobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl DeviceJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceJobStatus::Success | DeviceJobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub task_id: String,
    pub job_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub action_name: String,
    pub status: DeviceJobStatus,
    #[serde(default)]
    pub feedback_data: Value,
    #[serde(default)]
    pub return_info: Value,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub property_name: String,
    pub status: Value,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub ping_id: String,
    pub client_timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportActionState {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub task_id: String,
    pub job_id: String,
    pub device_id: String,
    pub action_name: String,
    pub free: bool,
    #[serde(default)]
    pub need_more_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReady {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: f64,
}

// ── typed directions ───────────────────────────────────────────────

/// A message the scheduler sends to the edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Dispatch(DispatchAction),
    QueryActionStatus(QueryActionStatus),
    Pong(Pong),
    CancelTask(CancelTask),
    Material(Value),
    Error(ErrorReply),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Dispatch(_) => kind::JOB_START,
            Outbound::QueryActionStatus(_) => kind::QUERY_ACTION_STATUS,
            Outbound::Pong(_) => kind::PONG,
            Outbound::CancelTask(_) => kind::CANCEL_TASK,
            Outbound::Material(_) => kind::MATERIAL,
            Outbound::Error(_) => kind::ERROR,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let data = match self {
            Outbound::Dispatch(p) => serde_json::to_value(p)?,
            Outbound::QueryActionStatus(p) => serde_json::to_value(p)?,
            Outbound::Pong(p) => serde_json::to_value(p)?,
            Outbound::CancelTask(p) => serde_json::to_value(p)?,
            Outbound::Material(v) => v.clone(),
            Outbound::Error(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            action: self.kind().to_string(),
            data,
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope()?)
    }
}

/// A message the edge sends to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    JobStatus(JobStatus),
    DeviceStatus(DeviceStatus),
    Ping(Ping),
    ReportActionState(ReportActionState),
    HostReady(HostReady),
    NormalExit,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { action, data } = envelope;
        let decoded = match action.as_str() {
            kind::JOB_STATUS => serde_json::from_value(data).map(Inbound::JobStatus),
            kind::DEVICE_STATUS => serde_json::from_value(data).map(Inbound::DeviceStatus),
            kind::PING => serde_json::from_value(data).map(Inbound::Ping),
            kind::REPORT_ACTION_STATE => {
                serde_json::from_value(data).map(Inbound::ReportActionState)
            }
            kind::HOST_READY => {
                // Older edges send `host_ready` with no data at all.
                let data = if data.is_null() { Value::Object(Default::default()) } else { data };
                serde_json::from_value(data).map(Inbound::HostReady)
            }
            kind::NORMAL_EXIT => Ok(Inbound::NormalExit),
            _ => return Err(ProtocolError::UnknownAction(action)),
        };
        decoded.map_err(|source| ProtocolError::InvalidPayload { action, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_job_status() {
        let text = json!({
            "action": "job_status",
            "data": {
                "task_id": "t-1",
                "job_id": "j-1",
                "device_id": "pump",
                "action_name": "dispense",
                "status": "success",
                "return_info": {"volume": 5}
            }
        })
        .to_string();
        match Inbound::parse(&text).unwrap() {
            Inbound::JobStatus(status) => {
                assert_eq!(status.status, DeviceJobStatus::Success);
                assert!(status.status.is_terminal());
                assert_eq!(status.return_info["volume"], 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_normal_exit_without_data() {
        let parsed = Inbound::parse(r#"{"action":"normal_exit"}"#).unwrap();
        assert_eq!(parsed, Inbound::NormalExit);
    }

    #[test]
    fn parse_host_ready_without_data() {
        let parsed = Inbound::parse(r#"{"action":"host_ready"}"#).unwrap();
        assert!(matches!(parsed, Inbound::HostReady(_)));
    }

    #[test]
    fn parse_report_action_state() {
        let text = r#"{"action":"report_action_state","data":{"type":"query_action_status","task_id":"t","job_id":"j","device_id":"d","action_name":"a","free":false,"need_more_seconds":30}}"#;
        match Inbound::parse(text).unwrap() {
            Inbound::ReportActionState(report) => {
                assert_eq!(report.kind, ActionKind::QueryStatus);
                assert!(!report.free);
                assert_eq!(report.need_more_seconds, 30);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_reported() {
        let err = Inbound::parse(r#"{"action":"teleport","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(a) if a == "teleport"));
    }

    #[test]
    fn bad_payload_is_reported() {
        let err = Inbound::parse(r#"{"action":"ping","data":{"ping_id":1}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(Inbound::parse("not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn dispatch_envelope_shape() {
        let msg = Outbound::Dispatch(DispatchAction {
            task_id: "t".into(),
            job_id: "j".into(),
            node_id: "n".into(),
            device_id: "arm".into(),
            action: "move".into(),
            action_type: "MoveTo".into(),
            action_args: json!({"x": 1}),
            server_info: ServerInfo { send_timestamp: 12.5 },
        });
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["action"], "job_start");
        assert_eq!(value["data"]["device_id"], "arm");
        assert_eq!(value["data"]["server_info"]["send_timestamp"], 12.5);
    }
}
