//! Standalone mode: every loop in one process.

use std::sync::Arc;

use anyhow::Context;
use fleet_autoscale::{Autoscaler, BusDispatcher, Dispatcher, HeartbeatListener, QueueDispatcher};
use fleet_bus::{InMemoryBus, MessageBus};
use fleet_core::{DispatchMode, FleetConfig};
use fleet_deployer::{
    DeploySubscriber, DeploymentQueue, OrphanReaper, ProcessTable, QueueConfig, RunDirectory,
    ScriptExecutor,
};
use fleet_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("fleet daemon starting in standalone mode");

    let node = config
        .daemon
        .node
        .clone()
        .context("daemon.node must name this host in standalone mode")?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = config.store()?;
    if let Some(parent) = store.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let state = StateStore::open(&store.path)?;
    info!(path = %store.path.display(), "state store opened");

    for network in state.list_networks()? {
        let foreign: Vec<&String> = network.nodes.iter().filter(|n| **n != node).collect();
        if !foreign.is_empty() {
            warn!(
                network = %network.name,
                nodes = ?foreign,
                %node,
                "network lists nodes without a daemon here, launches stay on this node"
            );
        }
    }

    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    info!(host = %config.bus()?.host, "message bus ready");

    let runs = RunDirectory::new(config.daemon.run_root.clone());
    let processes: Arc<dyn ProcessTable> = Arc::new(runs.clone());
    let executor = Arc::new(ScriptExecutor::new(runs));
    let (queue, queue_handle) = DeploymentQueue::new(
        state.clone(),
        executor,
        processes.clone(),
        QueueConfig::from_config(&config)?,
    );
    info!(
        run_root = %config.daemon.run_root.display(),
        base_port = config.daemon.base_port,
        "deployment queue initialized"
    );

    let subscriber = DeploySubscriber::start(bus.as_ref(), node.clone(), queue_handle.clone())?;
    let heartbeats = HeartbeatListener::start(bus.clone(), state.clone())?;

    let dispatcher: Arc<dyn Dispatcher> = match config.controller.dispatch {
        DispatchMode::Local => Arc::new(QueueDispatcher::new(queue_handle)),
        DispatchMode::Bus => Arc::new(BusDispatcher::new(bus.clone())),
    };
    let mut autoscaler = Autoscaler::new(state.clone(), bus.clone(), dispatcher)
        .with_config(&config.controller)
        .with_nodes([node.clone()]);
    info!(
        dispatch = ?config.controller.dispatch,
        interval_secs = config.controller.tick_interval_secs,
        "autoscaler initialized"
    );

    let reaper = OrphanReaper::new(
        state,
        bus,
        processes,
        node.clone(),
        config.daemon.reap_grace(),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let queue_task = tokio::spawn(queue.run(shutdown_rx.clone()));

    let tick_interval = config.controller.tick_interval();
    let autoscale_shutdown = shutdown_rx.clone();
    let autoscale_task = tokio::spawn(async move {
        autoscaler.run(tick_interval, autoscale_shutdown).await;
    });

    let reap_interval = config.daemon.reap_interval();
    let reaper_task = tokio::spawn(reaper.run(reap_interval, shutdown_rx));

    info!(node = %subscriber.node(), "fleet daemon running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    drop(subscriber);
    drop(heartbeats);
    let _ = autoscale_task.await;
    let _ = reaper_task.await;
    let _ = queue_task.await;

    info!("fleet daemon stopped");
    Ok(())
}
