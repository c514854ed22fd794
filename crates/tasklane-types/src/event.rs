use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Task, TaskId};

pub const TASK_CREATED: &str = "taskCreated";
pub const TASK_UPDATED: &str = "taskUpdated";
pub const TASK_DELETED: &str = "taskDeleted";

/// Push message describing one committed mutation.
///
/// The tag set is closed. Anything outside it is a [`ProtocolError`], never a
/// silently skipped message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TaskEvent {
    #[serde(rename = "taskCreated")]
    Created { task: Task },
    #[serde(rename = "taskUpdated")]
    Updated { task: Task },
    #[serde(rename = "taskDeleted")]
    Deleted {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => TASK_CREATED,
            TaskEvent::Updated { .. } => TASK_UPDATED,
            TaskEvent::Deleted { .. } => TASK_DELETED,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Created { task } | TaskEvent::Updated { task } => &task.id,
            TaskEvent::Deleted { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("push message has no `type` field")]
    MissingEventType,
    #[error("unknown push event type `{event_type}`")]
    UnknownEventType { event_type: String },
    #[error("malformed `{event_type}` event: {detail}")]
    MalformedEvent { event_type: String, detail: String },
    #[error("push message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unexpected push frame: {0}")]
    UnexpectedFrame(String),
}

/// Decodes one push message, checking the tag against the closed set before
/// decoding the payload.
pub fn decode_push_message(raw: &str) -> Result<TaskEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    decode_push_value(value)
}

pub fn decode_push_value(value: Value) -> Result<TaskEvent, ProtocolError> {
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingEventType)?
        .to_string();
    if ![TASK_CREATED, TASK_UPDATED, TASK_DELETED].contains(&event_type.as_str()) {
        return Err(ProtocolError::UnknownEventType { event_type });
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedEvent {
        event_type,
        detail: e.to_string(),
    })
}
