//! Teardown path for a process launched on this host.

use fleet_bus::{BusMessage, MessageBus};
use fleet_state::StateStore;
use tracing::{info, warn};

use crate::process::ProcessTable;

/// Which teardown steps succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub heartbeat_cleared: bool,
    pub signalled: bool,
    pub exit_hook_ran: bool,
    pub dir_removed: bool,
    pub record_deleted: bool,
    /// Steps that failed and were skipped over.
    pub failures: u32,
}

/// Tear down `name`: clear its heartbeat key, signal it, run its exit hook,
/// remove its run directory, and drop its instance record.
///
/// Every step is best-effort; a failure is logged and the next step runs.
pub fn kill_instance(
    name: &str,
    processes: &dyn ProcessTable,
    bus: &dyn MessageBus,
    state: &StateStore,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    match bus.clear_heartbeat(name) {
        Ok(existed) => report.heartbeat_cleared = existed,
        Err(e) => {
            warn!(%name, error = %e, "failed to clear heartbeat key");
            report.failures += 1;
        }
    }

    match processes.terminate(name) {
        Ok(()) => report.signalled = true,
        Err(e) => {
            warn!(%name, error = %e, "failed to signal process");
            report.failures += 1;
        }
    }

    match processes.run_exit_hook(name) {
        Ok(ran) => report.exit_hook_ran = ran,
        Err(e) => {
            warn!(%name, error = %e, "exit hook failed");
            report.failures += 1;
        }
    }

    match processes.remove(name) {
        Ok(()) => report.dir_removed = true,
        Err(e) => {
            warn!(%name, error = %e, "failed to remove run directory");
            report.failures += 1;
        }
    }

    match state.delete_instance(name) {
        Ok(existed) => report.record_deleted = existed,
        Err(e) => {
            warn!(%name, error = %e, "failed to delete instance record");
            report.failures += 1;
        }
    }

    if report.record_deleted
        && let Err(e) = bus.publish_message(&BusMessage::ServerShutdown {
            instance_id: name.to_string(),
        })
    {
        warn!(%name, error = %e, "failed to publish shutdown notification");
        report.failures += 1;
    }

    info!(%name, failures = report.failures, "teardown finished");
    report
}
