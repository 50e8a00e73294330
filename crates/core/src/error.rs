use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a generator failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Recoverable,
    Terminal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Recoverable => write!(f, "recoverable"),
            FailureKind::Terminal => write!(f, "terminal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Backlog full: {0}")]
    BacklogFull(String),

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Generator failure ({kind}): {message}")]
    Generator { kind: FailureKind, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON5 error: {0}")]
    Json5(#[from] json5::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Generator {
            kind: FailureKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Generator {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    /// Only recoverable generator failures and transport hiccups are retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Generator { kind, .. } => *kind == FailureKind::Recoverable,
            Error::Channel(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Errors raised while deciding whether a task may enter the queue.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::UnknownAgent(_)
                | Error::RateLimited(_)
                | Error::BacklogFull(_)
                | Error::AlreadyInProgress(_)
        )
    }

    /// Stable machine-readable code carried in responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnknownAgent(_) => "unknown_agent",
            Error::RateLimited(_) => "rate_limited",
            Error::BacklogFull(_) => "backlog_full",
            Error::AlreadyInProgress(_) => "already_in_progress",
            Error::Timeout(_) => "timeout",
            Error::Generator {
                kind: FailureKind::Recoverable,
                ..
            } => "generator_recoverable",
            Error::Generator {
                kind: FailureKind::Terminal,
                ..
            } => "generator_terminal",
            Error::Config(_) => "configuration_error",
            Error::Validation(_) => "validation",
            Error::Cancelled(_) => "cancelled",
            Error::Channel(_) => "channel",
            Error::Io(_) => "io",
            Error::Json(_) | Error::Yaml(_) | Error::Json5(_) => "serialization",
            Error::Other(_) => "internal",
        }
    }

    /// Text that is safe to show to the person on the other side of the chat.
    pub fn user_message(&self) -> String {
        match self {
            Error::UnknownAgent(_) => "No assistant is configured for this conversation.".to_string(),
            Error::RateLimited(_) => "You're sending messages too quickly. Please wait a moment and try again.".to_string(),
            Error::BacklogFull(_) => "I'm handling a lot of requests right now. Please try again shortly.".to_string(),
            Error::AlreadyInProgress(_) => "I'm still working on your previous message.".to_string(),
            Error::Timeout(_) => "Sorry, that took too long. Please try again.".to_string(),
            Error::Validation(msg) => format!("I couldn't process that: {}", msg),
            _ => "Sorry, something went wrong while handling your request.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::recoverable("503").is_recoverable());
        assert!(!Error::terminal("401").is_recoverable());
        assert!(!Error::Timeout("late".into()).is_recoverable());
        assert!(!Error::Validation("bad".into()).is_recoverable());
    }

    #[test]
    fn test_admission_errors() {
        assert!(Error::RateLimited("k".into()).is_admission());
        assert!(Error::AlreadyInProgress("k".into()).is_admission());
        assert!(!Error::Timeout("t".into()).is_admission());
        assert_eq!(Error::BacklogFull("x".into()).code(), "backlog_full");
    }

    #[test]
    fn test_user_message_hides_internals() {
        let msg = Error::terminal("api key sk-123 rejected").user_message();
        assert!(!msg.contains("sk-123"));
    }
}
