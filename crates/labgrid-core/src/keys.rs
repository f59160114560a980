//! Redis key namespaces.
//!
//! These are logical names; the backbone applies the configured
//! namespace prefix before they reach Redis.

/// Ownership TTL key for a lab's live connection.
pub fn lab_heart_key(lab_uuid: &str) -> String {
    format!("lab_heart_key_{lab_uuid}")
}

/// Per-lab queue of workflow start/stop/status jobs.
pub fn lab_task_queue(lab_uuid: &str) -> String {
    format!("lab_task_queue_{lab_uuid}")
}

/// Per-lab low-latency queue of ad-hoc actions and material mutations.
pub fn lab_control_queue(lab_uuid: &str) -> String {
    format!("lab_control_queue_{lab_uuid}")
}

/// Set of lab uuids whose connection this replica owns.
pub fn scheduler_users_set(schedule_id: &str) -> String {
    format!("lab_websocket_uuid_{schedule_id}_users")
}

/// Request payload of an ad-hoc action, written by the API layer.
pub fn action_request_key(task_uuid: &str) -> String {
    format!("workflow_action:{task_uuid}")
}

/// Result payload of an ad-hoc action, written by the action engine.
pub fn action_result_key(task_uuid: &str) -> String {
    format!("workflow_action:res:{task_uuid}")
}

/// Pub/sub channel for status events of one lab.
pub fn lab_notify_channel(lab_uuid: &str) -> String {
    format!("lab_notify_{lab_uuid}")
}
