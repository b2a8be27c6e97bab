//! Domain types for the fleet state store.
//!
//! These types are the persisted documents shared by the autoscaler, the
//! deployment queue, and the routing tier. All of them serialize to JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of a network.
pub type NetworkName = String;

/// Name of a server type or routing type.
pub type TypeName = String;

/// Name of a node.
pub type NodeName = String;

/// Default number of seconds an instance may go without a heartbeat.
pub const DEFAULT_TIMEOUT_SECS: u64 = 45;

// ── Network ───────────────────────────────────────────────────────

/// A named group of nodes and per-type quotas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Network {
    pub name: NetworkName,
    /// Quota records, processed in this order every tick.
    #[serde(default)]
    pub server_metadata: Vec<QuotaRecord>,
    /// Routing type name → desired routing-tier instance count.
    #[serde(default)]
    pub routing: BTreeMap<TypeName, u32>,
    /// Participating node names.
    #[serde(default)]
    pub nodes: Vec<NodeName>,
}

impl Network {
    /// Quota record for a server type, if the network still has one.
    pub fn quota_for(&self, server_type: &str) -> Option<&QuotaRecord> {
        self.server_metadata
            .iter()
            .find(|q| q.server_type == server_type)
    }
}

/// Per-network, per-type instance bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaRecord {
    pub server_type: TypeName,
    pub minimum_amount: u32,
    pub maximum_amount: u32,
}

impl QuotaRecord {
    pub fn new(server_type: impl Into<String>, minimum_amount: u32, maximum_amount: u32) -> Self {
        Self {
            server_type: server_type.into(),
            minimum_amount,
            maximum_amount,
        }
    }

    /// `minimum_amount <= maximum_amount`.
    pub fn is_valid(&self) -> bool {
        self.minimum_amount <= self.maximum_amount
    }
}

// ── Server type ───────────────────────────────────────────────────

/// Determines when a server type needs more instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchPolicy {
    /// Launch more when players exceed 75% of current capacity.
    PlayerLoad,
    /// Launch more when fewer than `minimum_amount` instances are joinable.
    Availability,
    /// Never launched; one operator-managed instance is registered.
    External { address: String, port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct World {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginRef {
    pub name: String,
    pub version: String,
}

/// Workload configuration shared by every instance of a type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerType {
    pub name: TypeName,
    /// Dedicated RAM in megabytes. Required for launching.
    #[serde(default)]
    pub dedicated_ram: Option<u32>,
    #[serde(default)]
    pub max_players: u32,
    /// Preferred node class; any class when absent.
    #[serde(default)]
    pub preferred_node: Option<String>,
    /// Required for reconciliation.
    #[serde(default)]
    pub launch_policy: Option<LaunchPolicy>,
    #[serde(default)]
    pub default_server: bool,
    /// Mod/image identifier selecting the launch template.
    #[serde(default)]
    pub mod_name: String,
    #[serde(default)]
    pub default_world: Option<World>,
    #[serde(default)]
    pub worlds: Vec<World>,
    #[serde(default)]
    pub random_default_world: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
    #[serde(default)]
    pub abbreviation: String,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ServerType {
    /// A type with the given name and every optional field unset.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dedicated_ram: None,
            max_players: 0,
            preferred_node: None,
            launch_policy: None,
            default_server: false,
            mod_name: String::new(),
            default_world: None,
            worlds: Vec::new(),
            random_default_world: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            plugins: Vec::new(),
            abbreviation: String::new(),
        }
    }

    /// Pick the world a fresh instance starts on.
    ///
    /// With `random_default_world`, `pick` receives the number of candidates
    /// (default world first, then `worlds`) and returns an index.
    pub fn choose_world(&self, pick: impl FnOnce(usize) -> usize) -> Option<&World> {
        if !self.random_default_world {
            return self.default_world.as_ref();
        }
        let candidates: Vec<&World> = self
            .default_world
            .iter()
            .chain(self.worlds.iter())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = pick(candidates.len()).min(candidates.len() - 1);
        Some(candidates[index])
    }
}

// ── Routing tier ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingType {
    pub name: TypeName,
    #[serde(default)]
    pub dedicated_ram: Option<u32>,
}

/// A routing-tier process; at most one exists per public IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingInstance {
    /// The node's public IP.
    pub id: String,
    pub routing_type: TypeName,
    pub node: NodeName,
    pub network: NetworkName,
    #[serde(default)]
    pub container_id: String,
    pub start_time: u64,
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: NodeName,
    pub private_ip: String,
    pub public_ip: String,
    #[serde(default)]
    pub node_class: Option<String>,
    /// Total RAM in megabytes.
    pub total_ram: u32,
}

// ── Instances ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerData {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}

impl Metadata {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A running or pending workload instance.
///
/// `ram_usage` and `port` are `None` until the workload agent reports them;
/// a record with both unset is provisional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub server_type: TypeName,
    pub network: NetworkName,
    pub node: NodeName,
    pub number: u32,
    pub port: Option<u16>,
    /// Reported RAM usage in megabytes.
    pub ram_usage: Option<u32>,
    /// RAM reserved at launch (the type's dedicated RAM).
    #[serde(default)]
    pub dedicated_ram: u32,
    #[serde(default)]
    pub online_players: Vec<PlayerData>,
    #[serde(default)]
    pub joinable: bool,
    #[serde(default)]
    pub tps: f64,
    pub start_time: u64,
    /// Unix seconds of the last heartbeat, if any arrived.
    #[serde(default)]
    pub last_heartbeat: Option<u64>,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl Instance {
    /// Registered but not yet confirmed alive.
    pub fn is_provisional(&self) -> bool {
        self.ram_usage.is_none() && self.port.is_none()
    }

    /// The agent reported memory but the process never obtained a port.
    pub fn is_crashed_launch(&self) -> bool {
        self.ram_usage.is_some() && self.port.is_none()
    }

    /// RAM counted against the node: reported usage, or the reservation.
    pub fn ram_footprint(&self) -> u32 {
        self.ram_usage.unwrap_or(self.dedicated_ram)
    }

    pub fn player_count(&self) -> usize {
        self.online_players.len()
    }

    pub fn player_by_name(&self, name: &str) -> Option<&PlayerData> {
        self.online_players
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn metadata_by(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }
}

/// An instance the fleet does not launch, only registers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalInstance {
    /// Same as the type name; one per type and network.
    pub id: String,
    pub server_type: TypeName,
    pub network: NetworkName,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub ram_usage: Option<u32>,
    #[serde(default)]
    pub online_players: Vec<PlayerData>,
    pub start_time: u64,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl ExternalInstance {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.network, self.id)
    }
}

/// Self-reported state from a workload agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub instance_id: String,
    pub ram_usage: u32,
    pub port: Option<u16>,
    pub tps: f64,
    pub online_players: Vec<PlayerData>,
    pub joinable: bool,
}
