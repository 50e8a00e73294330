//! Admission, queuing and execution of chat tasks.

pub mod dispatcher;
pub mod gateway;
pub mod handler;
pub mod ledger;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod router;

pub use dispatcher::{Dispatcher, DispatcherBuilder, TaskHandle};
pub use gateway::Gateway;
pub use handler::{DispatchStatus, HandlerContext, HandlerTable, TaskHandler};
pub use ledger::{KindStats, LedgerSummary, TaskLedger, TaskRecord};
pub use queue::{MemoryTaskQueue, QueueStats, TaskQueue};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{AgentRegistry, ConfigSource, FileSource, Snapshot, StaticSource};
pub use retry::RetryPolicy;
pub use router::{Route, Router};
