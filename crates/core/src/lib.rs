pub mod config;
pub mod connector;
pub mod error;
pub mod message;
pub mod paths;
pub mod task;

pub use config::{AgentDefinition, Config, DispatchConfig, RateLimitKey};
pub use connector::ConnectorAdapter;
pub use error::{Error, FailureKind, Result};
pub use message::{ErrorDetail, InboundEvent, Response};
pub use paths::Paths;
pub use task::{DedupKey, Priority, Task, TaskKind, TaskState};
