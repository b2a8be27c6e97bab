//! Node capacity snapshots.
//!
//! Bridges the store's [`Node`] documents and the instances running on them
//! to the placer's [`NodeLoad`].

use fleet_state::{InstanceFilter, Network, Node, RoutingFilter, StateResult, StateStore};

/// RAM accounting for one node at the moment of placement.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLoad {
    pub name: String,
    pub public_ip: String,
    pub node_class: Option<String>,
    /// Megabytes.
    pub total_ram: u32,
    /// Megabytes claimed by instances and routing-tier processes.
    pub used_ram: u32,
    /// Whether a routing-tier instance already lives on this host.
    pub hosts_routing: bool,
}

impl NodeLoad {
    pub fn free_ram(&self) -> u32 {
        self.total_ram.saturating_sub(self.used_ram)
    }

    /// Any class matches when `class` is `None`.
    pub fn matches_class(&self, class: Option<&str>) -> bool {
        class.is_none_or(|c| self.node_class.as_deref() == Some(c))
    }
}

/// Build a load snapshot for every node of a network, in the network's order.
///
/// Instance RAM is counted across all networks because a node's memory is
/// physical. Provisional instances count at their reserved RAM.
pub fn node_loads(state: &StateStore, network: &Network) -> StateResult<Vec<NodeLoad>> {
    let mut loads = Vec::with_capacity(network.nodes.len());
    for node in state.nodes_for(network)? {
        loads.push(load_for(state, node)?);
    }
    Ok(loads)
}

fn load_for(state: &StateStore, node: Node) -> StateResult<NodeLoad> {
    let instance_ram: u32 = state
        .find_instances(&InstanceFilter::new().node(&node.name))?
        .iter()
        .map(|i| i.ram_footprint())
        .fold(0u32, u32::saturating_add);

    let routing = state.find_routing_instances(&RoutingFilter::new().node(&node.name))?;
    let mut routing_ram = 0u32;
    for inst in &routing {
        let reserved = state
            .get_routing_type(&inst.routing_type)?
            .and_then(|t| t.dedicated_ram)
            .unwrap_or(0);
        routing_ram = routing_ram.saturating_add(reserved);
    }
    // A routing record is keyed by public IP, so another node sharing this
    // address also counts as hosting one.
    let hosts_routing = !routing.is_empty() || state.get_routing_instance(&node.public_ip)?.is_some();

    Ok(NodeLoad {
        used_ram: instance_ram.saturating_add(routing_ram),
        hosts_routing,
        name: node.name,
        public_ip: node.public_ip,
        node_class: node.node_class,
        total_ram: node.total_ram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{Instance, RoutingInstance, RoutingType};

    fn node(name: &str, ip: &str, ram: u32) -> Node {
        Node {
            name: name.to_string(),
            private_ip: "10.0.0.1".to_string(),
            public_ip: ip.to_string(),
            node_class: Some("standard".to_string()),
            total_ram: ram,
        }
    }

    fn instance(id: &str, node: &str, ram_usage: Option<u32>, dedicated: u32) -> Instance {
        Instance {
            id: id.to_string(),
            server_type: "lobby".to_string(),
            network: "prod".to_string(),
            node: node.to_string(),
            number: 1,
            port: None,
            ram_usage,
            dedicated_ram: dedicated,
            online_players: Vec::new(),
            joinable: false,
            tps: 0.0,
            start_time: 0,
            last_heartbeat: None,
            container_id: String::new(),
            metadata: Vec::new(),
        }
    }

    #[test]
    fn used_ram_counts_reservations_and_reports() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("n1", "203.0.113.1", 8192)).unwrap();
        store.put_instance(&instance("lobby1", "n1", None, 1024)).unwrap();
        store.put_instance(&instance("lobby2", "n1", Some(700), 1024)).unwrap();
        store.put_instance(&instance("lobby3", "n2", Some(4000), 1024)).unwrap();

        let network = Network {
            name: "prod".to_string(),
            nodes: vec!["n1".to_string()],
            ..Network::default()
        };
        let loads = node_loads(&store, &network).unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].used_ram, 1724);
        assert_eq!(loads[0].free_ram(), 8192 - 1724);
        assert!(!loads[0].hosts_routing);
    }

    #[test]
    fn routing_instances_mark_host_and_claim_ram() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("n1", "203.0.113.1", 4096)).unwrap();
        store
            .put_routing_type(&RoutingType {
                name: "proxy".to_string(),
                dedicated_ram: Some(512),
            })
            .unwrap();
        store
            .put_routing_instance(&RoutingInstance {
                id: "203.0.113.1".to_string(),
                routing_type: "proxy".to_string(),
                node: "n1".to_string(),
                network: "prod".to_string(),
                container_id: String::new(),
                start_time: 0,
            })
            .unwrap();

        let network = Network {
            name: "prod".to_string(),
            nodes: vec!["n1".to_string()],
            ..Network::default()
        };
        let loads = node_loads(&store, &network).unwrap();
        assert!(loads[0].hosts_routing);
        assert_eq!(loads[0].free_ram(), 3584);
    }

    #[test]
    fn class_matching() {
        let load = NodeLoad {
            name: "n1".to_string(),
            public_ip: String::new(),
            node_class: Some("big".to_string()),
            total_ram: 0,
            used_ram: 0,
            hosts_routing: false,
        };
        assert!(load.matches_class(None));
        assert!(load.matches_class(Some("big")));
        assert!(!load.matches_class(Some("small")));
    }
}
