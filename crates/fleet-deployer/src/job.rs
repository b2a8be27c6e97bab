//! Units of work for the deployment queue.

use fleet_bus::BusMessage;
use fleet_state::Metadata;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Instance {
        server_type: String,
        metadata: Vec<Metadata>,
    },
    Routing {
        routing_type: String,
    },
}

/// An in-memory launch request; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchJob {
    pub network: String,
    /// Node the process must run on.
    pub node: String,
    pub kind: JobKind,
}

impl LaunchJob {
    pub fn instance(
        network: impl Into<String>,
        node: impl Into<String>,
        server_type: impl Into<String>,
        metadata: Vec<Metadata>,
    ) -> Self {
        Self {
            network: network.into(),
            node: node.into(),
            kind: JobKind::Instance {
                server_type: server_type.into(),
                metadata,
            },
        }
    }

    pub fn routing(
        network: impl Into<String>,
        node: impl Into<String>,
        routing_type: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            node: node.into(),
            kind: JobKind::Routing {
                routing_type: routing_type.into(),
            },
        }
    }

    /// Type name, for logging.
    pub fn type_name(&self) -> &str {
        match &self.kind {
            JobKind::Instance { server_type, .. } => server_type,
            JobKind::Routing { routing_type } => routing_type,
        }
    }

    /// Convert a create command from the bus. Other messages yield `None`.
    pub fn from_message(message: BusMessage) -> Option<Self> {
        match message {
            BusMessage::ServerCreate {
                node,
                network,
                server_type,
                metadata,
            } => Some(Self::instance(
                network,
                node,
                server_type,
                metadata
                    .into_iter()
                    .map(|(k, v)| Metadata::new(k, v))
                    .collect(),
            )),
            BusMessage::BungeeCreate {
                node,
                network,
                routing_type,
            } => Some(Self::routing(network, node, routing_type)),
            _ => None,
        }
    }

    /// The create command that carries this job to a remote daemon.
    pub fn to_message(&self) -> BusMessage {
        match &self.kind {
            JobKind::Instance {
                server_type,
                metadata,
            } => BusMessage::ServerCreate {
                node: self.node.clone(),
                network: self.network.clone(),
                server_type: server_type.clone(),
                metadata: metadata
                    .iter()
                    .map(|m| (m.key.clone(), m.value.clone()))
                    .collect(),
            },
            JobKind::Routing { routing_type } => BusMessage::BungeeCreate {
                node: self.node.clone(),
                network: self.network.clone(),
                routing_type: routing_type.clone(),
            },
        }
    }
}

/// Result of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Process started and its record saved.
    Started { name: String, pid: u32 },
    /// A process with this name is already running; nothing was done.
    AlreadyRunning { name: String },
    /// The node's public IP already hosts a routing-tier instance.
    RoutingTaken { public_ip: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_commands_convert_both_ways() {
        let job = LaunchJob::instance(
            "prod",
            "n1",
            "lobby",
            vec![Metadata::new("map", "castle")],
        );
        let back = LaunchJob::from_message(job.to_message()).unwrap();
        assert_eq!(back, job);

        let routing = LaunchJob::routing("prod", "n2", "proxy");
        assert_eq!(routing.type_name(), "proxy");
        assert!(matches!(
            routing.to_message(),
            BusMessage::BungeeCreate { ref node, .. } if node == "n2"
        ));
    }

    #[test]
    fn notifications_are_not_jobs() {
        assert!(
            LaunchJob::from_message(BusMessage::ServerShutdown {
                instance_id: "lobby1".to_string()
            })
            .is_none()
        );
    }
}
