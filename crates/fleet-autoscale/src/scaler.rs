//! Autoscaler: level-triggered reconciliation of every network.
//!
//! Each tick re-reads the store, so a missed or reordered external edit is
//! corrected on the next pass. The autoscaler never starts processes itself;
//! placed launch jobs go to a [`Dispatcher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_bus::{BusMessage, MessageBus};
use fleet_core::ControllerConfig;
use fleet_deployer::LaunchJob;
use fleet_placement::{NodePlacer, PlacementError, PlacementRequest};
use fleet_state::store::epoch_secs;
use fleet_state::{
    DEFAULT_TIMEOUT_SECS, ExternalInstance, Instance, InstanceFilter, LaunchPolicy, Network,
    QuotaRecord, RoutingFilter, ServerType, StateStore,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::policy;

/// What one tick did, summed over all networks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub networks: u32,
    /// Networks whose reconciliation stopped on a store error.
    pub failed_networks: u32,
    pub launches: u32,
    pub routing_launches: u32,
    /// Instance ids deleted by garbage collection.
    pub collected: Vec<String>,
    /// Empty default instances retired by scale-down.
    pub retired: Vec<String>,
    pub externals_registered: u32,
    /// Launches deferred because no node qualified.
    pub placement_failures: u32,
    pub reconnected: bool,
}

pub struct Autoscaler {
    state: StateStore,
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<dyn Dispatcher>,
    placer: NodePlacer,
    /// Pause before every dispatched launch.
    dispatch_delay: Duration,
}

impl Autoscaler {
    pub fn new(
        state: StateStore,
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            state,
            bus,
            dispatcher,
            placer: NodePlacer::new(),
            dispatch_delay: Duration::ZERO,
        }
    }

    pub fn with_config(mut self, config: &ControllerConfig) -> Self {
        self.dispatch_delay = config.dispatch_delay();
        self
    }

    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    /// Place launches only on nodes that run a daemon listening for them.
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = String>) -> Self {
        self.placer.restrict_to(nodes);
        self
    }

    /// One full pass over every network.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            reconnected: self.check_transport(),
            ..TickReport::default()
        };
        self.placer.begin_tick();

        let networks = match self.state.list_networks() {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "failed to list networks");
                return report;
            }
        };

        for network in &networks {
            report.networks += 1;
            if let Err(e) = self.reconcile_network(network, &mut report).await {
                report.failed_networks += 1;
                error!(network = %network.name, error = %e, "network reconciliation failed");
            }
        }

        debug!(
            networks = report.networks,
            launches = report.launches,
            routing_launches = report.routing_launches,
            collected = report.collected.len(),
            retired = report.retired.len(),
            "tick finished"
        );
        report
    }

    /// Tick until shutdown.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    /// Reconnect the bus if it dropped. Returns whether a reconnect succeeded.
    fn check_transport(&self) -> bool {
        if self.bus.is_connected() {
            return false;
        }
        warn!("message bus disconnected, reconnecting");
        match self.bus.reconnect() {
            Ok(()) => {
                info!("message bus reconnected");
                true
            }
            Err(e) => {
                error!(error = %e, "message bus reconnect failed, continuing with store reads");
                false
            }
        }
    }

    async fn reconcile_network(
        &mut self,
        network: &Network,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        self.collect_garbage(network, report)?;
        self.ensure_routing_tier(network, report).await?;
        for quota in &network.server_metadata {
            self.reconcile_quota(network, quota, report).await?;
        }
        Ok(())
    }

    // ── Garbage collection ────────────────────────────────────────

    fn collect_garbage(&self, network: &Network, report: &mut TickReport) -> anyhow::Result<()> {
        let instances = self
            .state
            .find_instances(&InstanceFilter::new().network(&network.name))?;
        let now = epoch_secs();
        let mut timeouts: HashMap<String, u64> = HashMap::new();

        for inst in &instances {
            let reason = if inst.is_crashed_launch() {
                "crashed launch"
            } else if self.heartbeat_expired(inst, now, &mut timeouts)? {
                "heartbeat timeout"
            } else if network.quota_for(&inst.server_type).is_none() {
                "no quota record"
            } else {
                continue;
            };

            if self.state.delete_instance(&inst.id)? {
                info!(
                    network = %network.name,
                    instance = %inst.id,
                    reason,
                    "instance collected"
                );
                self.notify_shutdown(&inst.id);
                report.collected.push(inst.id.clone());
            }
        }
        Ok(())
    }

    fn heartbeat_expired(
        &self,
        inst: &Instance,
        now: u64,
        timeouts: &mut HashMap<String, u64>,
    ) -> anyhow::Result<bool> {
        let Some(last) = inst.last_heartbeat else {
            return Ok(false);
        };
        let timeout = match timeouts.get(&inst.server_type) {
            Some(t) => *t,
            None => {
                let t = self
                    .state
                    .get_server_type(&inst.server_type)?
                    .map_or(DEFAULT_TIMEOUT_SECS, |ty| ty.timeout_secs);
                timeouts.insert(inst.server_type.clone(), t);
                t
            }
        };
        Ok(now.saturating_sub(last) > timeout)
    }

    fn notify_shutdown(&self, instance_id: &str) {
        let message = BusMessage::ServerShutdown {
            instance_id: instance_id.to_string(),
        };
        if let Err(e) = self.bus.publish_message(&message) {
            warn!(instance = %instance_id, error = %e, "failed to publish shutdown notification");
        }
    }

    // ── Routing tier ──────────────────────────────────────────────

    async fn ensure_routing_tier(
        &mut self,
        network: &Network,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        for (routing_type, desired) in &network.routing {
            let filter = RoutingFilter::new()
                .network(&network.name)
                .routing_type(routing_type);
            let online = self.state.count_routing_instances(&filter)?;
            let deficit = desired.saturating_sub(online);
            if deficit == 0 {
                continue;
            }

            let Some(ty) = self.state.get_routing_type(routing_type)? else {
                warn!(network = %network.name, %routing_type, "unknown routing type, skipping");
                continue;
            };
            let request = PlacementRequest::routing(ty.dedicated_ram.unwrap_or(0));

            for _ in 0..deficit {
                tokio::time::sleep(self.dispatch_delay).await;
                let node = match self.placer.select_node(&self.state, network, &request) {
                    Ok(node) => node,
                    Err(PlacementError::NotFound { .. }) => {
                        info!(
                            network = %network.name,
                            %routing_type,
                            "no free node for routing instance, retrying next tick"
                        );
                        report.placement_failures += 1;
                        break;
                    }
                    Err(PlacementError::State(e)) => return Err(e.into()),
                };

                let job = LaunchJob::routing(&network.name, &node.name, routing_type);
                if let Err(e) = self.dispatcher.dispatch(&job) {
                    warn!(network = %network.name, %routing_type, error = %e, "routing dispatch failed");
                    break;
                }
                info!(
                    network = %network.name,
                    %routing_type,
                    node = %node.name,
                    public_ip = %node.public_ip,
                    "routing instance requested"
                );
                report.routing_launches += 1;
            }
        }
        Ok(())
    }

    // ── Quotas ────────────────────────────────────────────────────

    async fn reconcile_quota(
        &mut self,
        network: &Network,
        quota: &QuotaRecord,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let Some(ty) = self.state.get_server_type(&quota.server_type)? else {
            warn!(network = %network.name, server_type = %quota.server_type, "unknown server type, quota skipped");
            return Ok(());
        };
        let Some(launch_policy) = ty.launch_policy.clone() else {
            warn!(network = %network.name, server_type = %ty.name, "server type has no launch policy, quota skipped");
            return Ok(());
        };

        if let LaunchPolicy::External { address, port } = &launch_policy {
            return self.ensure_external(network, &ty, address, *port, report);
        }

        let Some(dedicated_ram) = ty.dedicated_ram else {
            warn!(network = %network.name, server_type = %ty.name, "server type has no dedicated RAM, quota skipped");
            return Ok(());
        };

        let instances = self.state.find_instances(
            &InstanceFilter::new()
                .network(&network.name)
                .server_type(&ty.name),
        )?;
        let online = instances.len() as u32;

        let needed = match launch_policy {
            LaunchPolicy::PlayerLoad => {
                let players: usize = instances.iter().map(Instance::player_count).sum();
                policy::player_load_needed(quota, online, players as u32, ty.max_players)
            }
            LaunchPolicy::Availability => {
                let available = instances.iter().filter(|i| i.joinable).count() as u32;
                policy::availability_needed(quota, available)
            }
            LaunchPolicy::External { .. } => 0,
        };
        let needed = policy::clamp_needed(needed, quota, online);

        if needed > 0 {
            debug!(
                network = %network.name,
                server_type = %ty.name,
                online,
                needed,
                "launching instances"
            );
            self.launch(network, &ty, dedicated_ram, needed, report).await;
        } else if ty.default_server && online > quota.minimum_amount {
            self.scale_down(network, quota, &instances, report)?;
        }
        Ok(())
    }

    async fn launch(
        &mut self,
        network: &Network,
        ty: &ServerType,
        dedicated_ram: u32,
        needed: u32,
        report: &mut TickReport,
    ) {
        let request = PlacementRequest::instance(ty.preferred_node.clone(), dedicated_ram);
        for _ in 0..needed {
            tokio::time::sleep(self.dispatch_delay).await;
            let node = match self.placer.select_node(&self.state, network, &request) {
                Ok(node) => node,
                Err(PlacementError::NotFound { required_ram, .. }) => {
                    info!(
                        network = %network.name,
                        server_type = %ty.name,
                        required_ram,
                        "no node can host instance, retrying next tick"
                    );
                    report.placement_failures += 1;
                    return;
                }
                Err(PlacementError::State(e)) => {
                    error!(network = %network.name, server_type = %ty.name, error = %e, "placement failed");
                    return;
                }
            };

            let job = LaunchJob::instance(&network.name, &node.name, &ty.name, Vec::new());
            if let Err(e) = self.dispatcher.dispatch(&job) {
                warn!(network = %network.name, server_type = %ty.name, error = %e, "launch dispatch failed");
                return;
            }
            info!(
                network = %network.name,
                server_type = %ty.name,
                node = %node.name,
                "instance requested"
            );
            report.launches += 1;
        }
    }

    /// Retire empty instances while staying above the minimum. Provisional
    /// records have not reported players yet and are left alone. The counter
    /// is local; concurrent writes are corrected on the next tick.
    fn scale_down(
        &self,
        network: &Network,
        quota: &QuotaRecord,
        instances: &[Instance],
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let mut surplus = policy::surplus(quota, instances.len() as u32);
        for inst in instances {
            if surplus == 0 {
                break;
            }
            if inst.player_count() > 0 || inst.is_provisional() {
                continue;
            }
            if self.state.delete_instance(&inst.id)? {
                surplus -= 1;
                info!(
                    network = %network.name,
                    instance = %inst.id,
                    surplus,
                    "empty instance retired"
                );
                self.notify_shutdown(&inst.id);
                report.retired.push(inst.id.clone());
            }
        }
        Ok(())
    }

    /// Register the operator-managed instance once.
    fn ensure_external(
        &self,
        network: &Network,
        ty: &ServerType,
        address: &str,
        port: u16,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        if self
            .state
            .count_external_instances(&network.name, &ty.name)?
            > 0
        {
            return Ok(());
        }

        self.state.put_external_instance(&ExternalInstance {
            id: ty.name.clone(),
            server_type: ty.name.clone(),
            network: network.name.clone(),
            address: address.to_string(),
            port,
            ram_usage: None,
            online_players: Vec::new(),
            start_time: epoch_secs(),
            metadata: Vec::new(),
        })?;
        report.externals_registered += 1;
        info!(network = %network.name, server_type = %ty.name, %address, port, "external instance registered");

        let message = BusMessage::ExternalServerAdd {
            instance_id: ty.name.clone(),
        };
        if let Err(e) = self.bus.publish_message(&message) {
            warn!(server_type = %ty.name, error = %e, "failed to publish external instance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_bus::InMemoryBus;
    use fleet_deployer::JobKind;
    use fleet_state::{Node, PlayerData, RoutingInstance, RoutingType};
    use std::sync::Mutex;

    /// Records jobs and, when `register` is set, writes the record a
    /// successful launch would produce.
    struct RecordingDispatcher {
        jobs: Mutex<Vec<LaunchJob>>,
        register: Option<StateStore>,
    }

    impl RecordingDispatcher {
        fn recording() -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
                register: None,
            })
        }

        fn registering(state: &StateStore) -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
                register: Some(state.clone()),
            })
        }

        fn jobs(&self) -> Vec<LaunchJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, job: &LaunchJob) -> anyhow::Result<()> {
            if let Some(state) = &self.register {
                match &job.kind {
                    JobKind::Instance { server_type, .. } => {
                        let number = state.next_number_for(server_type)?;
                        let id = format!("{server_type}{number}");
                        anyhow::ensure!(
                            state.get_instance(&id)?.is_none(),
                            "{id} is already registered"
                        );
                        let mut inst = instance(&id, server_type, 0);
                        inst.node = job.node.clone();
                        inst.number = number;
                        inst.port = None;
                        inst.ram_usage = None;
                        state.put_instance(&inst)?;
                    }
                    JobKind::Routing { routing_type } => {
                        let node = state.get_node(&job.node)?.unwrap();
                        state.put_routing_instance(&RoutingInstance {
                            id: node.public_ip,
                            routing_type: routing_type.clone(),
                            node: node.name,
                            network: job.network.clone(),
                            container_id: String::new(),
                            start_time: 0,
                        })?;
                    }
                }
            }
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    fn instance(id: &str, server_type: &str, players: usize) -> Instance {
        Instance {
            id: id.to_string(),
            server_type: server_type.to_string(),
            network: "prod".to_string(),
            node: "n1".to_string(),
            number: id
                .trim_start_matches(|c: char| !c.is_ascii_digit())
                .parse()
                .unwrap_or(1),
            port: Some(32812),
            ram_usage: Some(512),
            dedicated_ram: 1024,
            online_players: (0..players)
                .map(|i| PlayerData {
                    id: format!("{id}-p{i}"),
                    name: format!("player{i}"),
                })
                .collect(),
            joinable: true,
            tps: 20.0,
            start_time: 0,
            last_heartbeat: None,
            container_id: String::new(),
            metadata: Vec::new(),
        }
    }

    fn lobby_type(policy: LaunchPolicy) -> ServerType {
        ServerType {
            dedicated_ram: Some(1024),
            max_players: 20,
            launch_policy: Some(policy),
            default_server: true,
            mod_name: "lobby".to_string(),
            ..ServerType::named("lobby")
        }
    }

    /// Two 16 GB nodes and a "prod" network with the given quotas.
    fn seeded(quotas: Vec<QuotaRecord>) -> StateStore {
        let state = StateStore::open_in_memory().unwrap();
        for (name, ip) in [("n1", "203.0.113.1"), ("n2", "203.0.113.2")] {
            state
                .put_node(&Node {
                    name: name.to_string(),
                    private_ip: "10.0.0.1".to_string(),
                    public_ip: ip.to_string(),
                    node_class: None,
                    total_ram: 16384,
                })
                .unwrap();
        }
        state
            .put_network(&Network {
                name: "prod".to_string(),
                server_metadata: quotas,
                routing: Default::default(),
                nodes: vec!["n1".to_string(), "n2".to_string()],
            })
            .unwrap();
        state
    }

    fn scaler(
        state: &StateStore,
        bus: &Arc<InMemoryBus>,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> Autoscaler {
        Autoscaler::new(state.clone(), bus.clone(), dispatcher)
    }

    fn lobby_count(state: &StateStore) -> u32 {
        state
            .count_instances(&InstanceFilter::new().network("prod").server_type("lobby"))
            .unwrap()
    }

    #[tokio::test]
    async fn converges_to_minimum() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 5)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::registering(&state);
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        for _ in 0..4 {
            scaler.tick().await;
        }
        assert_eq!(lobby_count(&state), 2);
        assert_eq!(dispatcher.jobs().len(), 2);
    }

    #[tokio::test]
    async fn first_batch_spreads_across_nodes() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 5)]);
        let mut ty = lobby_type(LaunchPolicy::PlayerLoad);
        ty.dedicated_ram = Some(12288);
        state.put_server_type(&ty).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.launches, 2);
        let nodes: Vec<String> = dispatcher.jobs().into_iter().map(|j| j.node).collect();
        assert_eq!(nodes, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn launches_stay_on_served_nodes() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 5)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone()).with_nodes(["n1".to_string()]);

        // Unrestricted, the second launch would go to n2 (more free RAM after
        // the first reservation); n2 has no daemon here.
        assert_eq!(scaler.tick().await.launches, 2);
        assert!(dispatcher.jobs().iter().all(|j| j.node == "n1"));
    }

    #[tokio::test]
    async fn never_exceeds_maximum() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 3)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        state.put_instance(&instance("lobby1", "lobby", 50)).unwrap();
        state.put_instance(&instance("lobby2", "lobby", 50)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::registering(&state);
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        for _ in 0..3 {
            scaler.tick().await;
            assert!(lobby_count(&state) <= 3);
        }
        assert_eq!(lobby_count(&state), 3);
        assert_eq!(dispatcher.jobs().len(), 1);
        // The launch got a fresh number; the live records were left alone.
        assert_eq!(state.get_instance("lobby3").unwrap().unwrap().number, 3);
        assert_eq!(state.get_instance("lobby2").unwrap().unwrap().player_count(), 50);
    }

    #[tokio::test]
    async fn prod_lobby_scenario() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 4)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        state.put_instance(&instance("lobby1", "lobby", 8)).unwrap();
        state.put_instance(&instance("lobby2", "lobby", 8)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.launches, 0);
        assert!(report.retired.is_empty());

        state.put_instance(&instance("lobby1", "lobby", 16)).unwrap();
        state.put_instance(&instance("lobby2", "lobby", 16)).unwrap();
        let report = scaler.tick().await;
        assert_eq!(report.launches, 2);
        assert!(
            dispatcher
                .jobs()
                .iter()
                .all(|j| j.type_name() == "lobby" && j.network == "prod")
        );
    }

    #[tokio::test]
    async fn availability_keeps_joinable_instances() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 6)]);
        let mut ty = lobby_type(LaunchPolicy::Availability);
        ty.default_server = false;
        state.put_server_type(&ty).unwrap();
        let mut full = instance("lobby1", "lobby", 20);
        full.joinable = false;
        state.put_instance(&full).unwrap();
        state.put_instance(&instance("lobby2", "lobby", 3)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        assert_eq!(scaler.tick().await.launches, 1);
    }

    #[tokio::test]
    async fn scale_down_removes_only_empty_instances() {
        let state = seeded(vec![QuotaRecord::new("lobby", 3, 6)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        for (id, players) in [("lobby1", 1), ("lobby2", 0), ("lobby3", 2), ("lobby4", 0), ("lobby5", 1)] {
            state.put_instance(&instance(id, "lobby", players)).unwrap();
        }
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.retired, vec!["lobby2".to_string(), "lobby4".to_string()]);
        assert_eq!(report.launches, 0);
        assert_eq!(lobby_count(&state), 3);
        assert_eq!(bus.messages_published(), 2);

        // A second tick has nothing left to retire.
        assert!(scaler.tick().await.retired.is_empty());
    }

    #[tokio::test]
    async fn scale_down_stops_at_minimum() {
        let state = seeded(vec![QuotaRecord::new("lobby", 4, 6)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        for (id, players) in [("lobby1", 0), ("lobby2", 0), ("lobby3", 0), ("lobby4", 1), ("lobby5", 0)] {
            state.put_instance(&instance(id, "lobby", players)).unwrap();
        }
        let bus = Arc::new(InMemoryBus::new());
        let mut scaler = scaler(&state, &bus, RecordingDispatcher::recording());

        let report = scaler.tick().await;
        assert_eq!(report.retired.len(), 1);
        assert_eq!(lobby_count(&state), 4);
        assert!(state.get_instance("lobby4").unwrap().is_some());
    }

    #[tokio::test]
    async fn non_default_types_are_not_scaled_down() {
        let state = seeded(vec![QuotaRecord::new("lobby", 1, 6)]);
        let mut ty = lobby_type(LaunchPolicy::PlayerLoad);
        ty.default_server = false;
        state.put_server_type(&ty).unwrap();
        state.put_instance(&instance("lobby1", "lobby", 0)).unwrap();
        state.put_instance(&instance("lobby2", "lobby", 0)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let mut scaler = scaler(&state, &bus, RecordingDispatcher::recording());

        assert!(scaler.tick().await.retired.is_empty());
        assert_eq!(lobby_count(&state), 2);
    }

    #[tokio::test]
    async fn external_registration_is_idempotent() {
        let state = seeded(vec![QuotaRecord::new("hub", 1, 1)]);
        state
            .put_server_type(&ServerType {
                launch_policy: Some(LaunchPolicy::External {
                    address: "198.51.100.7".to_string(),
                    port: 25565,
                }),
                ..ServerType::named("hub")
            })
            .unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        assert_eq!(scaler.tick().await.externals_registered, 1);
        assert_eq!(scaler.tick().await.externals_registered, 0);
        assert_eq!(state.count_external_instances("prod", "hub").unwrap(), 1);
        let registered = state.list_external_instances("prod").unwrap();
        assert_eq!(registered[0].address, "198.51.100.7");
        assert_eq!(registered[0].port, 25565);
        assert_eq!(bus.messages_published(), 1);
        assert!(dispatcher.jobs().is_empty());
    }

    #[tokio::test]
    async fn garbage_collection_rules() {
        let state = seeded(vec![QuotaRecord::new("lobby", 0, 10)]);
        let mut ty = lobby_type(LaunchPolicy::PlayerLoad);
        ty.default_server = false;
        ty.timeout_secs = 45;
        state.put_server_type(&ty).unwrap();

        let mut crashed = instance("lobby1", "lobby", 0);
        crashed.port = None;
        let mut provisional = instance("lobby2", "lobby", 0);
        provisional.port = None;
        provisional.ram_usage = None;
        let mut silent = instance("lobby3", "lobby", 0);
        silent.last_heartbeat = Some(epoch_secs() - 120);
        let mut fresh = instance("lobby4", "lobby", 0);
        fresh.last_heartbeat = Some(epoch_secs());
        let stale = instance("arena1", "arena", 0);
        for inst in [&crashed, &provisional, &silent, &fresh, &stale] {
            state.put_instance(inst).unwrap();
        }

        let bus = Arc::new(InMemoryBus::new());
        let mut scaler = scaler(&state, &bus, RecordingDispatcher::recording());
        let mut collected = scaler.tick().await.collected;
        collected.sort();
        assert_eq!(collected, vec!["arena1", "lobby1", "lobby3"]);
        assert!(state.get_instance("lobby2").unwrap().is_some());
        assert!(state.get_instance("lobby4").unwrap().is_some());
        assert_eq!(bus.messages_published(), 3);
    }

    #[tokio::test]
    async fn routing_tier_placements_are_exclusive() {
        let state = seeded(Vec::new());
        let mut network = state.get_network("prod").unwrap().unwrap();
        network.routing.insert("proxy".to_string(), 3);
        state.put_network(&network).unwrap();
        state
            .put_routing_type(&RoutingType {
                name: "proxy".to_string(),
                dedicated_ram: Some(512),
            })
            .unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.routing_launches, 2);
        assert_eq!(report.placement_failures, 1);
        let mut nodes: Vec<String> = dispatcher.jobs().into_iter().map(|j| j.node).collect();
        nodes.sort();
        assert_eq!(nodes, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn routing_tier_skips_hosts_already_serving() {
        let state = seeded(Vec::new());
        let mut network = state.get_network("prod").unwrap().unwrap();
        network.routing.insert("proxy".to_string(), 2);
        state.put_network(&network).unwrap();
        state
            .put_routing_type(&RoutingType {
                name: "proxy".to_string(),
                dedicated_ram: None,
            })
            .unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::registering(&state);
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        assert_eq!(scaler.tick().await.routing_launches, 2);
        // Both hosts now serve; the deficit is gone.
        assert_eq!(scaler.tick().await.routing_launches, 0);
        assert_eq!(dispatcher.jobs().len(), 2);
    }

    #[tokio::test]
    async fn incomplete_types_are_skipped() {
        let state = seeded(vec![
            QuotaRecord::new("nopolicy", 1, 2),
            QuotaRecord::new("noram", 1, 2),
            QuotaRecord::new("missing", 1, 2),
            QuotaRecord::new("lobby", 1, 2),
        ]);
        state.put_server_type(&ServerType::named("nopolicy")).unwrap();
        state
            .put_server_type(&ServerType {
                launch_policy: Some(LaunchPolicy::PlayerLoad),
                ..ServerType::named("noram")
            })
            .unwrap();
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.failed_networks, 0);
        assert_eq!(report.launches, 1);
        assert_eq!(dispatcher.jobs()[0].type_name(), "lobby");
    }

    #[tokio::test]
    async fn no_room_defers_to_next_tick() {
        let state = seeded(vec![QuotaRecord::new("lobby", 2, 4)]);
        let mut ty = lobby_type(LaunchPolicy::PlayerLoad);
        ty.dedicated_ram = Some(32768);
        state.put_server_type(&ty).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::recording();
        let mut scaler = scaler(&state, &bus, dispatcher.clone());

        let report = scaler.tick().await;
        assert_eq!(report.launches, 0);
        assert_eq!(report.placement_failures, 1);
        assert!(dispatcher.jobs().is_empty());
    }

    #[tokio::test]
    async fn reconnects_a_dropped_bus() {
        let state = seeded(Vec::new());
        let bus = Arc::new(InMemoryBus::new());
        bus.disconnect();
        let mut scaler = scaler(&state, &bus, RecordingDispatcher::recording());

        assert!(scaler.tick().await.reconnected);
        assert!(bus.is_connected());
        assert!(!scaler.tick().await.reconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let state = seeded(vec![QuotaRecord::new("lobby", 1, 2)]);
        state.put_server_type(&lobby_type(LaunchPolicy::PlayerLoad)).unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = RecordingDispatcher::registering(&state);
        let mut scaler = scaler(&state, &bus, dispatcher.clone())
            .with_dispatch_delay(Duration::from_millis(200));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scaler.run(Duration::from_secs(10), rx).await;
        });
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(lobby_count(&state), 1);
        assert_eq!(dispatcher.jobs().len(), 1);
    }
}
