//! fleet-deployer: turns deploy decisions into running processes.
//!
//! A per-host daemon runs exactly one [`DeploymentQueue`]. Producers (the
//! autoscaler in local mode, the bus subscriber in bus mode) push
//! [`LaunchJob`]s through a [`QueueHandle`]; the queue's single consumer
//! owns the port counter and is the only caller of the launch executor.
//!
//! # Architecture
//!
//! ```text
//! QueueHandle ──mpsc──▶ DeploymentQueue (single consumer, paced)
//!                         ├── PortAllocator (wrapping, skips live ports)
//!                         ├── LaunchExecutor (ScriptExecutor: sh start.sh)
//!                         ├── ProcessTable (RunDirectory: app.pid, kill)
//!                         └── StateStore (instance / routing records)
//!
//! DeploySubscriber  : bus create commands → QueueHandle
//! OrphanReaper      : run dirs without a store record → kill_instance
//! ```

pub mod env;
pub mod error;
pub mod executor;
pub mod job;
pub mod ports;
pub mod process;
pub mod queue;
pub mod reaper;
pub mod subscriber;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use env::{LaunchEnv, ROUTING_PROCESS, instance_script, routing_script};
pub use error::{DeployError, DeployResult};
pub use executor::{LaunchExecutor, ScriptExecutor};
pub use job::{JobKind, LaunchJob, LaunchOutcome};
pub use ports::PortAllocator;
pub use process::{ProcessTable, RunDirectory};
pub use queue::{DeploymentQueue, QueueConfig, QueueHandle};
pub use reaper::OrphanReaper;
pub use subscriber::DeploySubscriber;
pub use teardown::{TeardownReport, kill_instance};
