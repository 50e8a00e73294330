use futures::StreamExt;
use onio_core::{ConnectorAdapter, InboundEvent};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;

/// Wires connectors to the dispatcher: one receive loop per connector and one
/// spawned submission per event, so receipt never waits on execution.
pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    connectors: Vec<Arc<dyn ConnectorAdapter>>,
}

impl Gateway {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            connectors: Vec::new(),
        }
    }

    pub fn add_connector(&mut self, connector: Arc<dyn ConnectorAdapter>) {
        info!(platform = connector.platform(), "Connector registered");
        self.connectors.push(connector);
    }

    pub fn platforms(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.platform().to_string()).collect()
    }

    /// Find the connector for a platform, for out-of-band delivery.
    pub fn connector(&self, platform: &str) -> Option<Arc<dyn ConnectorAdapter>> {
        self.connectors.iter().find(|c| c.platform() == platform).cloned()
    }

    /// Run until `shutdown` fires or every connector stream ends.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.connectors.is_empty() {
            warn!("No connectors enabled, gateway idle");
        }
        let mut loops = JoinSet::new();
        for connector in &self.connectors {
            let connector = connector.clone();
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown.clone();
            loops.spawn(receive_loop(connector, dispatcher, shutdown));
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connector loop panicked");
            }
        }
        info!("Gateway stopped");
    }
}

async fn receive_loop(
    connector: Arc<dyn ConnectorAdapter>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    let platform = connector.platform().to_string();
    info!(platform = %platform, "Connector receive loop started");
    let mut events = connector.clone().receive();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(e) => e,
                None => {
                    warn!(platform = %platform, "Connector stream ended");
                    break;
                }
            },
        };
        let connector = connector.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { deliver(connector, dispatcher, event).await });
    }
    info!(platform = %platform, "Connector receive loop stopped");
}

async fn deliver(connector: Arc<dyn ConnectorAdapter>, dispatcher: Arc<Dispatcher>, event: InboundEvent) {
    debug!(event_id = %event.id, platform = %event.platform, conversation_id = %event.conversation_id, "Inbound event");
    let conversation_id = event.conversation_id.clone();
    let response = dispatcher.submit(event).await;
    if let Err(e) = connector.send(&conversation_id, &response).await {
        error!(
            platform = connector.platform(),
            conversation_id = %conversation_id,
            error = %e,
            "Failed to send response"
        );
    }
}
