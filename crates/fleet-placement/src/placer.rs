//! Placement engine.
//!
//! Given the nodes of a network and a request, the placer decides:
//! 1. Which nodes are eligible (node class, free RAM, exclusivity)
//! 2. Which eligible node wins (most free RAM, then name)
//! 3. What this tick has already handed out (RAM, and hosts for the routing tier)

use std::collections::{HashMap, HashSet};

use fleet_state::{Network, StateError, StateStore};
use thiserror::Error;
use tracing::debug;

use crate::load::{NodeLoad, node_loads};

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no node in network {network} can host {required_ram} MB")]
    NotFound { network: String, required_ram: u32 },

    #[error(transparent)]
    State(#[from] StateError),
}

/// What the caller needs from a host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacementRequest {
    /// Required node class; any class when `None`.
    pub node_class: Option<String>,
    /// Megabytes that must be free on the node.
    pub required_ram: u32,
    /// Routing-tier placement: one per host, and one per host per tick.
    pub exclusive: bool,
}

impl PlacementRequest {
    pub fn instance(node_class: Option<String>, required_ram: u32) -> Self {
        Self {
            node_class,
            required_ram,
            exclusive: false,
        }
    }

    pub fn routing(required_ram: u32) -> Self {
        Self {
            node_class: None,
            required_ram,
            exclusive: true,
        }
    }
}

/// Pick the best node for a request, ignoring the names in `taken`.
///
/// Pure: no store access, no bookkeeping.
pub fn select<'a>(
    nodes: &'a [NodeLoad],
    req: &PlacementRequest,
    taken: &HashSet<String>,
) -> Option<&'a NodeLoad> {
    nodes
        .iter()
        .filter(|n| n.matches_class(req.node_class.as_deref()))
        .filter(|n| !req.exclusive || (!n.hosts_routing && !taken.contains(&n.name)))
        .filter(|n| n.free_ram() >= req.required_ram)
        // Most free RAM wins; on a tie the lexically smaller name wins.
        .max_by(|a, b| {
            a.free_ram()
                .cmp(&b.free_ram())
                .then_with(|| b.name.cmp(&a.name))
        })
}

/// Node placer owned by one reconciliation loop.
///
/// The store does not see a launch until the deployment queue has processed
/// it, so the placer remembers what it handed out during the current tick:
/// the hosts given to exclusive placements and the RAM reserved per node.
#[derive(Debug, Default)]
pub struct NodePlacer {
    nodes_used: HashSet<String>,
    reserved_ram: HashMap<String, u32>,
    /// Nodes with a daemon able to launch; every node when `None`.
    allowed: Option<HashSet<String>>,
}

impl NodePlacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only place on the named nodes, whatever a network lists.
    pub fn restrict_to(&mut self, nodes: impl IntoIterator<Item = String>) {
        self.allowed = Some(nodes.into_iter().collect());
    }

    pub fn is_allowed(&self, node: &str) -> bool {
        self.allowed.as_ref().is_none_or(|a| a.contains(node))
    }

    /// Forget last tick's placements.
    pub fn begin_tick(&mut self) {
        self.nodes_used.clear();
        self.reserved_ram.clear();
    }

    pub fn nodes_used(&self) -> &HashSet<String> {
        &self.nodes_used
    }

    /// Choose among precomputed loads and record exclusive choices.
    pub fn place(
        &mut self,
        network: &str,
        nodes: &[NodeLoad],
        req: &PlacementRequest,
    ) -> Result<NodeLoad, PlacementError> {
        let adjusted: Vec<NodeLoad> = nodes
            .iter()
            .filter(|n| self.is_allowed(&n.name))
            .map(|n| {
                let mut n = n.clone();
                if let Some(reserved) = self.reserved_ram.get(&n.name) {
                    n.used_ram = n.used_ram.saturating_add(*reserved);
                }
                n
            })
            .collect();
        let Some(chosen) = select(&adjusted, req, &self.nodes_used) else {
            debug!(
                network,
                required_ram = req.required_ram,
                node_class = ?req.node_class,
                exclusive = req.exclusive,
                candidates = nodes.len(),
                "no node qualifies"
            );
            return Err(PlacementError::NotFound {
                network: network.to_string(),
                required_ram: req.required_ram,
            });
        };
        if req.exclusive {
            self.nodes_used.insert(chosen.name.clone());
        }
        let reserved = self.reserved_ram.entry(chosen.name.clone()).or_default();
        *reserved = reserved.saturating_add(req.required_ram);
        debug!(
            network,
            node = %chosen.name,
            free_ram = chosen.free_ram(),
            exclusive = req.exclusive,
            "node selected"
        );
        Ok(chosen.clone())
    }

    /// Read the network's nodes from the store and choose one.
    pub fn select_node(
        &mut self,
        state: &StateStore,
        network: &Network,
        req: &PlacementRequest,
    ) -> Result<NodeLoad, PlacementError> {
        let loads = node_loads(state, network)?;
        self.place(&network.name, &loads, req)
    }
}
