pub mod factory;
pub mod http;
pub mod offline;
pub mod openai;

use async_trait::async_trait;
use onio_core::{AgentDefinition, Result, Task};
use tokio_util::sync::CancellationToken;

/// Turns a task and its agent's personality into reply text.
///
/// Implementations must return promptly once `cancel` fires, and classify
/// failures with [`onio_core::Error::recoverable`] or [`onio_core::Error::terminal`]
/// so the dispatcher knows whether to retry.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, task: &Task, agent: &AgentDefinition, cancel: &CancellationToken) -> Result<String>;

    /// Short identifier used in logs and `/status`.
    fn name(&self) -> &str;
}

pub use factory::create_generator;
pub use offline::OfflineGenerator;
pub use openai::OpenAiGenerator;
