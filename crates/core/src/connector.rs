use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;
use crate::message::{InboundEvent, Response};

/// Boundary between the dispatcher and one chat platform.
///
/// `receive` hands out a lazy, potentially endless stream of events. Implementations
/// reconnect on their own when the underlying transport drops, so the stream only
/// ends when the connector is shut down or disabled.
#[async_trait]
pub trait ConnectorAdapter: Send + Sync {
    /// Platform identifier stamped on every event this connector produces.
    fn platform(&self) -> &str;

    fn receive(self: Arc<Self>) -> BoxStream<'static, InboundEvent>;

    async fn send(&self, conversation_id: &str, response: &Response) -> Result<()>;
}
