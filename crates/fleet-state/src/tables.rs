//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Networks keyed by name.
pub const NETWORKS: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// Server types keyed by name.
pub const SERVER_TYPES: TableDefinition<&str, &[u8]> = TableDefinition::new("server_types");

/// Routing-tier types keyed by name.
pub const ROUTING_TYPES: TableDefinition<&str, &[u8]> = TableDefinition::new("routing_types");

/// Nodes keyed by name.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Workload instances keyed by instance id (`{type}{number}`).
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Operator-managed instances keyed by id.
pub const EXTERNAL_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("external_instances");

/// Routing-tier instances keyed by public IP.
pub const ROUTING_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("routing_instances");
