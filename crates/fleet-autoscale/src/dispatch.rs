//! Where launch decisions go once the autoscaler has placed them.

use std::sync::Arc;

use anyhow::{Context, bail};
use fleet_bus::MessageBus;
use fleet_deployer::{LaunchJob, QueueHandle};
use tracing::debug;

/// Hands a placed launch job to whatever will start it.
///
/// Implementations must not block on the launch itself.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: &LaunchJob) -> anyhow::Result<()>;
}

/// Publishes `server-create` / `bungee-create` commands for the daemon on the
/// target node.
///
/// A command nobody is subscribed to is a failed dispatch, so the deficit is
/// retried next tick instead of being counted as launched.
pub struct BusDispatcher {
    bus: Arc<dyn MessageBus>,
}

impl BusDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

impl Dispatcher for BusDispatcher {
    fn dispatch(&self, job: &LaunchJob) -> anyhow::Result<()> {
        let message = job.to_message();
        let receivers = self
            .bus
            .publish_message(&message)
            .with_context(|| format!("publishing {} for {}", message.channel(), job.type_name()))?;
        if receivers == 0 {
            bail!(
                "no daemon listening on {} for {} on {}",
                message.channel(),
                job.type_name(),
                job.node
            );
        }
        debug!(
            channel = message.channel(),
            node = %job.node,
            receivers,
            "deploy command published"
        );
        Ok(())
    }
}

/// Enqueues straight into a deployment queue in this process.
#[derive(Clone)]
pub struct QueueDispatcher {
    queue: QueueHandle,
}

impl QueueDispatcher {
    pub fn new(queue: QueueHandle) -> Self {
        Self { queue }
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, job: &LaunchJob) -> anyhow::Result<()> {
        if !self.queue.enqueue(job.clone()) {
            bail!("deployment queue is closed, dropping {}", job.type_name());
        }
        Ok(())
    }
}
