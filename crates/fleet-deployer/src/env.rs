//! Launch environment construction.
//!
//! Workload agents read their identity, credentials, and sizing from the
//! environment of `start.sh`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fleet_core::{BusConfig, StoreConfig};
use fleet_state::{Node, RoutingType, ServerType, World};

/// Run-directory name of the routing-tier process (one per host).
pub const ROUTING_PROCESS: &str = "routing";

/// Template for an instance of a server type: `<root>/server/<mod>/init.sh`.
pub fn instance_script(script_root: &Path, mod_name: &str) -> PathBuf {
    script_root.join("server").join(mod_name).join("init.sh")
}

/// Template for a routing-tier process: `<root>/scripts/routing-init.sh`.
pub fn routing_script(script_root: &Path) -> PathBuf {
    script_root.join("scripts").join("routing-init.sh")
}

/// Ordered environment map handed to the launch executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: BTreeMap<String, String>,
}

impl LaunchEnv {
    /// Store and bus credentials every agent needs.
    pub fn with_credentials(store: &StoreConfig, bus: &BusConfig) -> Self {
        let mut env = Self::default();
        env.set("store_hosts", store.formatted_hosts());
        env.set("store_username", &store.username);
        env.set("store_password", &store.password);
        env.set("store_database", &store.database);
        env.set("bus_host", &bus.host);
        env.set("bus_password", &bus.password);
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Sizing, identity, world, and address of a server instance.
    pub fn instance(
        mut self,
        ty: &ServerType,
        dedicated_ram: u32,
        instance_id: &str,
        port: u16,
        node: &Node,
        world: Option<&World>,
    ) -> Self {
        self.set("SERVER_MOD", &ty.mod_name);
        self.set("DEDICATED_RAM", dedicated_ram.to_string());
        self.set("MAX_PLAYERS", ty.max_players.to_string());
        self.set("server_id", instance_id);
        if let Some(world) = world {
            self.set("DEFAULT_WORLD", &world.name);
            self.set("DEFAULT_WORLD_VERSION", &world.version);
        }
        self.set("PORT", port.to_string());
        self.set("PRIVATE_IP", &node.private_ip);
        self
    }

    /// Sizing and identity of a routing-tier process.
    pub fn routing(mut self, ty: &RoutingType, node: &Node) -> Self {
        if let Some(ram) = ty.dedicated_ram {
            self.set("DEDICATED_RAM", ram.to_string());
        }
        self.set("routing_id", &node.public_ip);
        self.set("PRIVATE_IP", &node.private_ip);
        self
    }
}
