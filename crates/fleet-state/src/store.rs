//! StateStore: redb-backed document store for the fleet.
//!
//! Provides typed save/get/query/delete operations over every entity the
//! autoscaler and the deployment queue share. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::filter::{InstanceFilter, RoutingFilter};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// redb locks the file for this process. Only the controller daemon opens
    /// it; agents report through `server-heartbeat` messages on the bus.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            NETWORKS,
            SERVER_TYPES,
            ROUTING_TYPES,
            NODES,
            INSTANCES,
            EXTERNAL_INSTANCES,
            ROUTING_INSTANCES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic document access ────────────────────────────────────

    fn save<T: Serialize>(&self, table: Table, key: &str, doc: &T) -> StateResult<()> {
        let value = serde_json::to_vec(doc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let doc = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Networks ───────────────────────────────────────────────────

    /// Insert or update a network. Quota records must satisfy `min <= max`.
    pub fn put_network(&self, network: &Network) -> StateResult<()> {
        if let Some(bad) = network.server_metadata.iter().find(|q| !q.is_valid()) {
            return Err(StateError::Invalid {
                id: network.name.clone(),
                reason: format!(
                    "quota for {} has minimum {} above maximum {}",
                    bad.server_type, bad.minimum_amount, bad.maximum_amount
                ),
            });
        }
        self.save(NETWORKS, &network.name, network)?;
        debug!(network = %network.name, "network stored");
        Ok(())
    }

    pub fn get_network(&self, name: &str) -> StateResult<Option<Network>> {
        self.load(NETWORKS, name)
    }

    /// All networks, in name order.
    pub fn list_networks(&self) -> StateResult<Vec<Network>> {
        self.scan(NETWORKS)
    }

    pub fn delete_network(&self, name: &str) -> StateResult<bool> {
        self.remove(NETWORKS, name)
    }

    // ── Server types ───────────────────────────────────────────────

    pub fn put_server_type(&self, ty: &ServerType) -> StateResult<()> {
        self.save(SERVER_TYPES, &ty.name, ty)
    }

    pub fn get_server_type(&self, name: &str) -> StateResult<Option<ServerType>> {
        self.load(SERVER_TYPES, name)
    }

    pub fn list_server_types(&self) -> StateResult<Vec<ServerType>> {
        self.scan(SERVER_TYPES)
    }

    // ── Routing types ──────────────────────────────────────────────

    pub fn put_routing_type(&self, ty: &RoutingType) -> StateResult<()> {
        self.save(ROUTING_TYPES, &ty.name, ty)
    }

    pub fn get_routing_type(&self, name: &str) -> StateResult<Option<RoutingType>> {
        self.load(ROUTING_TYPES, name)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.save(NODES, &node.name, node)
    }

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        self.load(NODES, name)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.scan(NODES)
    }

    /// Nodes participating in a network, in the network's order.
    ///
    /// Names that no longer resolve to a node document are skipped.
    pub fn nodes_for(&self, network: &Network) -> StateResult<Vec<Node>> {
        let mut nodes = Vec::with_capacity(network.nodes.len());
        for name in &network.nodes {
            if let Some(node) = self.get_node(name)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance by id.
    pub fn put_instance(&self, inst: &Instance) -> StateResult<()> {
        self.save(INSTANCES, &inst.id, inst)
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.load(INSTANCES, id)
    }

    pub fn find_instances(&self, filter: &InstanceFilter) -> StateResult<Vec<Instance>> {
        let all: Vec<Instance> = self.scan(INSTANCES)?;
        Ok(all.into_iter().filter(|i| filter.matches(i)).collect())
    }

    pub fn count_instances(&self, filter: &InstanceFilter) -> StateResult<u32> {
        Ok(self.find_instances(filter)?.len() as u32)
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(INSTANCES, id)?;
        debug!(instance = %id, existed, "instance deleted");
        Ok(existed)
    }

    /// Delete every instance matching the filter. Returns the deleted ids.
    pub fn delete_instances(&self, filter: &InstanceFilter) -> StateResult<Vec<String>> {
        // Collect ids in a read transaction first.
        let ids: Vec<String> = self
            .find_instances(filter)?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for id in &ids {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(ids)
    }

    /// Smallest positive instance number not taken by an instance of the type.
    pub fn next_number_for(&self, server_type: &str) -> StateResult<u32> {
        let taken: BTreeSet<u32> = self
            .find_instances(&InstanceFilter::new().server_type(server_type))?
            .into_iter()
            .map(|i| i.number)
            .collect();
        Ok((1..).find(|n| !taken.contains(n)).unwrap_or(1))
    }

    /// Apply an agent heartbeat to its instance record.
    ///
    /// Returns false when the instance no longer exists, in which case the
    /// heartbeat is dropped rather than resurrecting a deleted record.
    pub fn apply_heartbeat(&self, beat: &Heartbeat) -> StateResult<bool> {
        let Some(mut inst) = self.get_instance(&beat.instance_id)? else {
            debug!(instance = %beat.instance_id, "heartbeat for unknown instance dropped");
            return Ok(false);
        };
        inst.ram_usage = Some(beat.ram_usage);
        inst.port = beat.port;
        inst.tps = beat.tps;
        inst.online_players = beat.online_players.clone();
        inst.joinable = beat.joinable;
        inst.last_heartbeat = Some(epoch_secs());
        self.put_instance(&inst)?;
        Ok(true)
    }

    // ── External instances ─────────────────────────────────────────

    pub fn put_external_instance(&self, inst: &ExternalInstance) -> StateResult<()> {
        self.save(EXTERNAL_INSTANCES, &inst.table_key(), inst)
    }

    pub fn list_external_instances(&self, network: &str) -> StateResult<Vec<ExternalInstance>> {
        let all: Vec<ExternalInstance> = self.scan(EXTERNAL_INSTANCES)?;
        Ok(all.into_iter().filter(|i| i.network == network).collect())
    }

    pub fn count_external_instances(&self, network: &str, server_type: &str) -> StateResult<u32> {
        Ok(self
            .list_external_instances(network)?
            .iter()
            .filter(|i| i.server_type == server_type)
            .count() as u32)
    }

    // ── Routing instances ──────────────────────────────────────────

    pub fn put_routing_instance(&self, inst: &RoutingInstance) -> StateResult<()> {
        self.save(ROUTING_INSTANCES, &inst.id, inst)
    }

    pub fn get_routing_instance(&self, public_ip: &str) -> StateResult<Option<RoutingInstance>> {
        self.load(ROUTING_INSTANCES, public_ip)
    }

    pub fn find_routing_instances(
        &self,
        filter: &RoutingFilter,
    ) -> StateResult<Vec<RoutingInstance>> {
        let all: Vec<RoutingInstance> = self.scan(ROUTING_INSTANCES)?;
        Ok(all.into_iter().filter(|i| filter.matches(i)).collect())
    }

    pub fn count_routing_instances(&self, filter: &RoutingFilter) -> StateResult<u32> {
        Ok(self.find_routing_instances(filter)?.len() as u32)
    }

    pub fn delete_routing_instance(&self, public_ip: &str) -> StateResult<bool> {
        self.remove(ROUTING_INSTANCES, public_ip)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
