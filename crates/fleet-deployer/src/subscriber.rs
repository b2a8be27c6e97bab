//! Deploy-command subscriber for a per-host daemon.

use std::sync::Arc;

use fleet_bus::{BusResult, Handler, MessageBus, Subscription, channels};
use tracing::{debug, info};

use crate::job::LaunchJob;
use crate::queue::QueueHandle;

/// Forwards `server-create` / `bungee-create` commands addressed to this
/// node into the local deployment queue.
///
/// The callbacks only enqueue. Dropping the subscriber unsubscribes.
pub struct DeploySubscriber {
    node: String,
    _subscriptions: Vec<Subscription>,
}

impl DeploySubscriber {
    pub fn start(bus: &dyn MessageBus, node: impl Into<String>, queue: QueueHandle) -> BusResult<Self> {
        let node = node.into();
        let mut subscriptions = Vec::with_capacity(2);
        for channel in [channels::SERVER_CREATE, channels::BUNGEE_CREATE] {
            subscriptions.push(bus.subscribe(channel, forwarder(node.clone(), queue.clone()))?);
        }
        info!(%node, "listening for deploy commands");
        Ok(Self {
            node,
            _subscriptions: subscriptions,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

fn forwarder(node: String, queue: QueueHandle) -> Handler {
    Arc::new(move |message| {
        let Some(job) = LaunchJob::from_message(message) else {
            return;
        };
        if job.node != node {
            debug!(target_node = %job.node, %node, "deploy command for another node ignored");
            return;
        }
        queue.enqueue(job);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DeploymentQueue, QueueConfig};
    use crate::testing::{FakeExecutor, FakeProcesses};
    use fleet_bus::InMemoryBus;
    use fleet_core::{BusConfig, StoreConfig};
    use fleet_state::StateStore;
    use std::path::PathBuf;
    use std::time::Duration;

    fn queue() -> (DeploymentQueue, QueueHandle) {
        let procs = Arc::new(FakeProcesses::default());
        DeploymentQueue::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(FakeExecutor::new(procs.clone())),
            procs,
            QueueConfig {
                base_port: 32812,
                pacing: Duration::ZERO,
                idle_poll: Duration::ZERO,
                script_root: PathBuf::from("/mnt/fleet"),
                store: StoreConfig {
                    path: PathBuf::from("fleet.redb"),
                    hosts: vec!["db".to_string()],
                    username: String::new(),
                    password: String::new(),
                    database: "fleet".to_string(),
                },
                bus: BusConfig {
                    host: "bus".to_string(),
                    password: String::new(),
                },
            },
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn only_own_node_commands_are_enqueued() {
        let bus = InMemoryBus::new();
        let (mut queue, handle) = queue();
        let subscriber = DeploySubscriber::start(&bus, "n1", handle).unwrap();
        assert_eq!(subscriber.node(), "n1");

        bus.publish_message(&LaunchJob::instance("prod", "n2", "lobby", Vec::new()).to_message())
            .unwrap();
        bus.publish_message(&LaunchJob::instance("prod", "n1", "lobby", Vec::new()).to_message())
            .unwrap();
        bus.publish_message(&LaunchJob::routing("prod", "n1", "proxy").to_message())
            .unwrap();
        settle().await;

        let mut jobs = Vec::new();
        while let Some(job) = queue.try_next() {
            jobs.push(job);
        }
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.node == "n1"));
        assert!(jobs.iter().any(|j| j.type_name() == "proxy"));
    }

    #[tokio::test]
    async fn dropping_subscriber_stops_forwarding() {
        let bus = InMemoryBus::new();
        let (mut queue, handle) = queue();
        drop(DeploySubscriber::start(&bus, "n1", handle).unwrap());
        settle().await;

        bus.publish_message(&LaunchJob::instance("prod", "n1", "lobby", Vec::new()).to_message())
            .unwrap();
        settle().await;
        assert!(queue.try_next().is_none());
    }
}
