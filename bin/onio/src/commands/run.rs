use onio_channels::{ApiConnector, DiscordConnector, TelegramConnector};
use onio_core::Error;
use onio_dispatch::{AgentRegistry, ConfigSource, Dispatcher, Gateway, MemoryTaskQueue, TaskQueue};
use onio_providers::create_generator;
use onio_scheduler::JobScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::LoadedConfig;

pub async fn run(config_path: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let loaded = super::load(config_path)?;
    crate::logging::init(verbose, &loaded.config.logging);
    let config = &loaded.config;

    if config.dispatch.distributed_tasks {
        return Err(Error::Config(
            "distributed task queue requested (FEATURE_DISTRIBUTED_TASKS) but no external queue backend is available"
                .to_string(),
        )
        .into());
    }

    let registry = Arc::new(AgentRegistry::new(config.agents.clone(), config.dispatch.max_agents)?);
    let generator = create_generator(&config.provider);
    let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::from_config(&config.dispatch));
    let dispatcher = Dispatcher::new(config, registry.clone(), generator, queue);
    let dispatch_loop = dispatcher.start();

    let shutdown = CancellationToken::new();
    let mut background = JoinSet::new();

    let mut gateway = Gateway::new(dispatcher.clone());
    let channels = &config.channels;
    if channels.telegram.enabled {
        gateway.add_connector(Arc::new(TelegramConnector::new(channels.telegram.clone())));
    }
    if channels.discord.enabled {
        gateway.add_connector(Arc::new(DiscordConnector::new(channels.discord.clone())));
    }
    if channels.api.enabled {
        let api = Arc::new(ApiConnector::new(channels.api.clone()));
        gateway.add_connector(api.clone());
        let token = shutdown.clone();
        background.spawn(async move {
            if let Err(e) = api.serve(token).await {
                error!(error = %e, "API connector failed");
            }
        });
    }
    if gateway.platforms().is_empty() {
        warn!("No connectors enabled; only scheduled jobs will produce tasks");
    }

    if !config.schedule.is_empty() {
        let mut scheduler =
            JobScheduler::new(config.schedule.clone(), config.dispatch.task_interval(), dispatcher.clone())?;
        for platform in gateway.platforms() {
            if let Some(connector) = gateway.connector(&platform) {
                scheduler = scheduler.with_connector(connector);
            }
        }
        background.spawn(Arc::new(scheduler).run(shutdown.clone()));
    }

    spawn_reload(&mut background, &loaded, registry.clone(), shutdown.clone());

    let gateway = Arc::new(gateway);
    {
        let gateway = gateway.clone();
        let token = shutdown.clone();
        background.spawn(async move { gateway.run(token).await });
    }

    info!(
        agents = registry.agent_ids().len(),
        connectors = ?gateway.platforms(),
        jobs = config.schedule.len(),
        "onio is running. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    dispatcher.shutdown().await;
    while let Some(joined) = background.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    if let Err(e) = dispatch_loop.await {
        warn!(error = %e, "Dispatch loop ended abnormally");
    }
    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload(
    background: &mut JoinSet<()>,
    loaded: &LoadedConfig,
    registry: Arc<AgentRegistry>,
    shutdown: CancellationToken,
) {
    background.spawn(reload_on_hangup(loaded.reload_source(), registry, shutdown));
}

#[cfg(not(unix))]
fn spawn_reload(_: &mut JoinSet<()>, _: &LoadedConfig, _: Arc<AgentRegistry>, _: CancellationToken) {}

/// Re-read agent definitions each time the process receives SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(source: Box<dyn ConfigSource>, registry: Arc<AgentRegistry>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, live reload disabled");
            return;
        }
    };
    info!(source = %source.describe(), "Agent definitions reload on SIGHUP");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                // Failures are logged by the registry and leave the old snapshot active.
                if let Ok(generation) = registry.reload(source.as_ref()) {
                    info!(generation, "Agent definitions in effect");
                }
            }
        }
    }
}
