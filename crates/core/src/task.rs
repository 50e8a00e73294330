use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::InboundEvent;

/// Closed set of task kinds an agent can be configured to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Greeting,
    Help,
    Status,
    Joke,
    Calculation,
    Chat,
    Custom,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Greeting,
        TaskKind::Help,
        TaskKind::Status,
        TaskKind::Joke,
        TaskKind::Calculation,
        TaskKind::Chat,
        TaskKind::Custom,
    ];

    /// Map a chat command (without prefix) to a task kind.
    /// Unrecognized commands are `Custom`.
    pub fn from_command(command: &str) -> TaskKind {
        match command.to_ascii_lowercase().as_str() {
            "start" | "hello" | "hi" | "greet" => TaskKind::Greeting,
            "help" => TaskKind::Help,
            "status" => TaskKind::Status,
            "joke" => TaskKind::Joke,
            "calc" | "calculate" | "math" => TaskKind::Calculation,
            "chat" | "ask" => TaskKind::Chat,
            _ => TaskKind::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Greeting => "greeting",
            TaskKind::Help => "help",
            TaskKind::Status => "status",
            TaskKind::Joke => "joke",
            TaskKind::Calculation => "calculation",
            TaskKind::Chat => "chat",
            TaskKind::Custom => "custom",
        }
    }

    /// Command users type to trigger this kind, if any.
    pub fn command(&self) -> Option<&'static str> {
        match self {
            TaskKind::Greeting => Some("start"),
            TaskKind::Help => Some("help"),
            TaskKind::Status => Some("status"),
            TaskKind::Joke => Some("joke"),
            TaskKind::Calculation => Some("calc"),
            TaskKind::Chat | TaskKind::Custom => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskKind::Greeting => "Start the conversation",
            TaskKind::Help => "Show this help message",
            TaskKind::Status => "Check bot status",
            TaskKind::Joke => "Tell a joke",
            TaskKind::Calculation => "Evaluate an arithmetic expression",
            TaskKind::Chat => "Chat with the assistant",
            TaskKind::Custom => "Custom command",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            TaskKind::Help | TaskKind::Status => Priority::High,
            TaskKind::Greeting | TaskKind::Joke | TaskKind::Calculation => Priority::Normal,
            TaskKind::Chat | TaskKind::Custom => Priority::Low,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue lane. Lower ordinal is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn lane(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Received,
    Admitted,
    Queued,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Rejected,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Rejected
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Received => "received",
            TaskState::Admitted => "admitted",
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Identity used to keep at most one task per agent and conversation in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupKey {
    pub agent_id: String,
    pub conversation_id: String,
}

impl DedupKey {
    pub fn new(agent_id: &str, conversation_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.conversation_id)
    }
}

/// A unit of work. Carries only data so a networked queue can transport it;
/// response channels and cancellation live with the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub agent_id: String,
    pub dedup_key: DedupKey,
    pub event: InboundEvent,
    /// Command name as typed, without prefix. `None` for free text.
    #[serde(default)]
    pub command: Option<String>,
    /// Text after the command, or the whole message for free text.
    pub args: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Agent concurrency cap captured at admission.
    pub max_concurrency: usize,
    pub state: TaskState,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        agent_id: &str,
        event: InboundEvent,
        command: Option<String>,
        args: String,
        timeout: std::time::Duration,
        max_concurrency: usize,
    ) -> Self {
        let submitted_at = Utc::now();
        let deadline = submitted_at
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            agent_id: agent_id.to_string(),
            dedup_key: DedupKey::new(agent_id, &event.conversation_id),
            event,
            command,
            args,
            priority: kind.priority(),
            submitted_at,
            deadline,
            retry_count: 0,
            max_concurrency: max_concurrency.max(1),
            state: TaskState::Received,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
