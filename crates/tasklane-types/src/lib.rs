pub mod event;
pub mod health;
pub mod task;
pub mod user;

pub use event::*;
pub use health::*;
pub use task::*;
pub use user::*;

use serde::{Deserialize, Serialize};

/// Body returned by the service for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}
