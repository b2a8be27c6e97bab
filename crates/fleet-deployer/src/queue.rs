//! Deployment queue: the single consumer of launch jobs on a host.
//!
//! Producers hold a [`QueueHandle`]; `enqueue` never blocks. The consumer
//! pops one job at a time, launches it, and then waits out the pacing delay
//! so a burst of decisions does not start every process at once.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{BusConfig, ConfigError, FleetConfig, StoreConfig};
use fleet_state::store::epoch_secs;
use fleet_state::{Instance, InstanceFilter, RoutingInstance, StateStore};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::env::{LaunchEnv, ROUTING_PROCESS, instance_script, routing_script};
use crate::error::{DeployError, DeployResult};
use crate::executor::LaunchExecutor;
use crate::job::{JobKind, LaunchJob, LaunchOutcome};
use crate::ports::PortAllocator;
use crate::process::ProcessTable;

/// Settings the queue consumer needs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_port: u16,
    pub pacing: Duration,
    pub idle_poll: Duration,
    pub script_root: PathBuf,
    pub store: StoreConfig,
    pub bus: BusConfig,
}

impl QueueConfig {
    pub fn from_config(config: &FleetConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base_port: config.daemon.base_port,
            pacing: config.daemon.pacing(),
            idle_poll: config.daemon.idle_poll(),
            script_root: config.daemon.script_root.clone(),
            store: config.store()?.clone(),
            bus: config.bus()?.clone(),
        })
    }
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<LaunchJob>,
}

impl QueueHandle {
    /// Append a job. Returns false once the consumer is gone.
    pub fn enqueue(&self, job: LaunchJob) -> bool {
        let network = job.network.clone();
        let node = job.node.clone();
        match self.tx.send(job) {
            Ok(()) => {
                debug!(%network, %node, "launch job enqueued");
                true
            }
            Err(mpsc::error::SendError(job)) => {
                warn!(%network, %node, job_type = job.type_name(), "deployment queue closed, job dropped");
                false
            }
        }
    }
}

/// Consumer side of the queue.
pub struct DeploymentQueue {
    rx: mpsc::UnboundedReceiver<LaunchJob>,
    state: StateStore,
    executor: Arc<dyn LaunchExecutor>,
    processes: Arc<dyn ProcessTable>,
    ports: PortAllocator,
    config: QueueConfig,
}

impl DeploymentQueue {
    pub fn new(
        state: StateStore,
        executor: Arc<dyn LaunchExecutor>,
        processes: Arc<dyn ProcessTable>,
        config: QueueConfig,
    ) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            rx,
            state,
            executor,
            processes,
            ports: PortAllocator::new(config.base_port),
            config,
        };
        (queue, QueueHandle { tx })
    }

    /// Pop one job without waiting.
    pub fn try_next(&mut self) -> Option<LaunchJob> {
        self.rx.try_recv().ok()
    }

    /// Process every job queued right now, without pacing.
    pub fn drain(&mut self) -> Vec<DeployResult<LaunchOutcome>> {
        let mut results = Vec::new();
        while let Some(job) = self.try_next() {
            results.push(self.process(&job));
        }
        results
    }

    /// Run the consumer loop until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pacing_ms = self.config.pacing.as_millis() as u64,
            base_port = self.config.base_port,
            "deployment queue started"
        );

        loop {
            let delay = match self.rx.try_recv() {
                Ok(job) => {
                    self.handle(&job);
                    self.config.pacing
                }
                Err(mpsc::error::TryRecvError::Empty) => self.config.idle_poll,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("all queue handles dropped, deployment queue stopping");
                    break;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("deployment queue shutting down");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, job: &LaunchJob) {
        match self.process(job) {
            Ok(LaunchOutcome::Started { name, pid }) => {
                info!(network = %job.network, node = %job.node, %name, pid, "launch job completed");
            }
            Ok(LaunchOutcome::AlreadyRunning { name }) => {
                debug!(%name, "process already running, job skipped");
            }
            Ok(LaunchOutcome::RoutingTaken { public_ip }) => {
                warn!(
                    network = %job.network,
                    node = %job.node,
                    %public_ip,
                    "routing-tier instance not created, public ip already in use"
                );
            }
            Err(e) => {
                error!(
                    network = %job.network,
                    node = %job.node,
                    job_type = job.type_name(),
                    error = %e,
                    "launch job abandoned"
                );
            }
        }
    }

    /// Launch one job and register it in the store.
    pub fn process(&mut self, job: &LaunchJob) -> DeployResult<LaunchOutcome> {
        match &job.kind {
            JobKind::Instance {
                server_type,
                metadata,
            } => self.launch_instance(job, server_type, metadata),
            JobKind::Routing { routing_type } => self.launch_routing(job, routing_type),
        }
    }

    fn launch_instance(
        &mut self,
        job: &LaunchJob,
        type_name: &str,
        metadata: &[fleet_state::Metadata],
    ) -> DeployResult<LaunchOutcome> {
        let ty = self
            .state
            .get_server_type(type_name)?
            .ok_or_else(|| DeployError::UnknownServerType(type_name.to_string()))?;
        let dedicated_ram = ty
            .dedicated_ram
            .ok_or_else(|| DeployError::MissingRam(type_name.to_string()))?;
        let node = self
            .state
            .get_node(&job.node)?
            .ok_or_else(|| DeployError::UnknownNode(job.node.clone()))?;

        let number = self.state.next_number_for(type_name)?;
        let name = format!("{type_name}{number}");
        if self.processes.is_running(&name) {
            return Ok(LaunchOutcome::AlreadyRunning { name });
        }

        let live: HashSet<u16> = self
            .state
            .find_instances(&InstanceFilter::new().node(&node.name).has_port(true))?
            .into_iter()
            .filter_map(|i| i.port)
            .collect();
        let port = self
            .ports
            .allocate(&live)
            .ok_or_else(|| DeployError::PortsExhausted {
                base: self.ports.base(),
                node: node.name.clone(),
            })?;

        let world = ty
            .choose_world(|n| rand::thread_rng().gen_range(0..n))
            .cloned();
        let env = LaunchEnv::with_credentials(&self.config.store, &self.config.bus).instance(
            &ty,
            dedicated_ram,
            &name,
            port,
            &node,
            world.as_ref(),
        );
        let script = instance_script(&self.config.script_root, &ty.mod_name);
        let pid = self.executor.launch(&name, &script, &env)?;

        let instance = Instance {
            id: name.clone(),
            server_type: type_name.to_string(),
            network: job.network.clone(),
            node: node.name.clone(),
            number,
            port: None,
            ram_usage: None,
            dedicated_ram,
            online_players: Vec::new(),
            joinable: false,
            tps: 0.0,
            start_time: epoch_secs(),
            last_heartbeat: None,
            container_id: pid.to_string(),
            metadata: metadata.to_vec(),
        };
        self.state.put_instance(&instance)?;
        info!(
            %name,
            network = %job.network,
            node = %node.name,
            port,
            pid,
            "instance started"
        );
        Ok(LaunchOutcome::Started { name, pid })
    }

    fn launch_routing(&mut self, job: &LaunchJob, type_name: &str) -> DeployResult<LaunchOutcome> {
        let ty = self
            .state
            .get_routing_type(type_name)?
            .ok_or_else(|| DeployError::UnknownRoutingType(type_name.to_string()))?;
        let node = self
            .state
            .get_node(&job.node)?
            .ok_or_else(|| DeployError::UnknownNode(job.node.clone()))?;

        if self.state.get_routing_instance(&node.public_ip)?.is_some() {
            return Ok(LaunchOutcome::RoutingTaken {
                public_ip: node.public_ip,
            });
        }
        if self.processes.is_running(ROUTING_PROCESS) {
            return Ok(LaunchOutcome::AlreadyRunning {
                name: ROUTING_PROCESS.to_string(),
            });
        }

        let env =
            LaunchEnv::with_credentials(&self.config.store, &self.config.bus).routing(&ty, &node);
        let script = routing_script(&self.config.script_root);
        let pid = self.executor.launch(ROUTING_PROCESS, &script, &env)?;

        self.state.put_routing_instance(&RoutingInstance {
            id: node.public_ip.clone(),
            routing_type: type_name.to_string(),
            node: node.name.clone(),
            network: job.network.clone(),
            container_id: pid.to_string(),
            start_time: epoch_secs(),
        })?;
        info!(
            public_ip = %node.public_ip,
            network = %job.network,
            node = %node.name,
            pid,
            "routing-tier instance started"
        );
        Ok(LaunchOutcome::Started {
            name: ROUTING_PROCESS.to_string(),
            pid,
        })
    }
}
