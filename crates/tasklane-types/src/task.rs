use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub type TaskId = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("label must not be empty")]
    EmptyLabel,
}

/// A task label that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label(String);

impl Label {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if !Self::is_valid(&raw) {
            return Err(ValidationError::EmptyLabel);
        }
        Ok(Self(raw))
    }

    /// Whether `parse` would accept `raw`.
    pub fn is_valid(raw: &str) -> bool {
        !raw.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<TaskImage>,
    pub owner_id: String,
}

impl Task {
    pub fn new(owner_id: impl Into<String>, label: Label, image: Option<TaskImage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into_inner(),
            done: false,
            image,
            owner_id: owner_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTaskRequest {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<TaskImage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTaskRequest {
    pub done: bool,
}
