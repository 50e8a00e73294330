use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::task::TaskState;

/// A chat message normalized by a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub id: String,
    pub platform: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

impl InboundEvent {
    pub fn new(platform: &str, conversation_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            metadata: serde_json::Value::Null,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.platform, self.conversation_id)
    }

    /// Display name supplied by the platform, falling back to the sender id.
    pub fn sender_name(&self) -> &str {
        self.metadata
            .get("username")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.sender_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorDetail {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// The single reply produced for every task, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event_id: String,
    pub platform: String,
    pub conversation_id: String,
    pub state: TaskState,
    pub success: bool,
    pub text: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl Response {
    pub fn completed(event: &InboundEvent, task_id: &str, text: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            event_id: event.id.clone(),
            platform: event.platform.clone(),
            conversation_id: event.conversation_id.clone(),
            state: TaskState::Completed,
            success: true,
            text: text.to_string(),
            payload: serde_json::Value::Null,
            error: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    /// Terminal failure response. `state` must be one of the failing terminal states.
    pub fn failed(event: &InboundEvent, task_id: Option<&str>, state: TaskState, error: &Error) -> Self {
        Self {
            task_id: task_id.map(str::to_string),
            event_id: event.id.clone(),
            platform: event.platform.clone(),
            conversation_id: event.conversation_id.clone(),
            state,
            success: false,
            text: error.user_message(),
            payload: serde_json::Value::Null,
            error: Some(ErrorDetail::from(error)),
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn rejected(event: &InboundEvent, error: &Error) -> Self {
        Self::failed(event, None, TaskState::Rejected, error)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
