//! Orphan reaper.
//!
//! Scale-down and garbage collection only delete instance records. This loop
//! finds run directories on this host whose record is gone and tears the
//! process down.

use std::sync::Arc;
use std::time::Duration;

use fleet_bus::MessageBus;
use fleet_state::store::epoch_secs;
use fleet_state::{RoutingFilter, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::env::ROUTING_PROCESS;
use crate::error::DeployResult;
use crate::process::ProcessTable;
use crate::teardown::kill_instance;

pub struct OrphanReaper {
    state: StateStore,
    bus: Arc<dyn MessageBus>,
    processes: Arc<dyn ProcessTable>,
    node: String,
    grace: Duration,
}

impl OrphanReaper {
    pub fn new(
        state: StateStore,
        bus: Arc<dyn MessageBus>,
        processes: Arc<dyn ProcessTable>,
        node: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            state,
            bus,
            processes,
            node: node.into(),
            grace,
        }
    }

    fn has_record(&self, name: &str) -> DeployResult<bool> {
        if name == ROUTING_PROCESS {
            let filter = RoutingFilter::new().node(&self.node);
            return Ok(self.state.count_routing_instances(&filter)? > 0);
        }
        Ok(self.state.get_instance(name)?.is_some())
    }

    /// Tear down every unrecorded process older than the grace period.
    /// Returns the names torn down.
    pub fn sweep(&self) -> DeployResult<Vec<String>> {
        let now = epoch_secs();
        let mut reaped = Vec::new();
        for name in self.processes.list()? {
            if self.has_record(&name)? {
                continue;
            }
            // Launches register their record right after the start call, so a
            // young directory may simply not be recorded yet.
            if let Some(started) = self.processes.started_at(&name)
                && now.saturating_sub(started) < self.grace.as_secs()
            {
                debug!(%name, "unrecorded process still within grace period");
                continue;
            }
            info!(%name, node = %self.node, "reaping orphaned process");
            kill_instance(&name, self.processes.as_ref(), self.bus.as_ref(), &self.state);
            reaped.push(name);
        }
        Ok(reaped)
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "orphan reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep() {
                        error!(error = %e, "orphan sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("orphan reaper shutting down");
                    break;
                }
            }
        }
    }
}
