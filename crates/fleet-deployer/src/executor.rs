//! Launch executor: starts a process from a script template.
//!
//! The queue only cares whether the *start* call succeeded; liveness is
//! confirmed later by the workload agent's heartbeat.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::env::LaunchEnv;
use crate::error::{DeployError, DeployResult};
use crate::process::{CONSOLE_LOG, RunDirectory, START_SCRIPT};

/// Starts processes. Implementations must not block on the process itself.
pub trait LaunchExecutor: Send + Sync {
    /// Start `name` from `script` with `env`. Returns the process id.
    fn launch(&self, name: &str, script: &Path, env: &LaunchEnv) -> DeployResult<u32>;
}

/// Runs `sh start.sh` inside a fresh run directory.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    runs: RunDirectory,
}

impl ScriptExecutor {
    pub fn new(runs: RunDirectory) -> Self {
        Self { runs }
    }
}

impl LaunchExecutor for ScriptExecutor {
    fn launch(&self, name: &str, script: &Path, env: &LaunchEnv) -> DeployResult<u32> {
        if !script.is_file() {
            return Err(DeployError::Launch {
                name: name.to_string(),
                reason: format!("script template {} not found", script.display()),
            });
        }
        let runtime = Handle::try_current().map_err(|_| DeployError::Launch {
            name: name.to_string(),
            reason: "no tokio runtime to supervise the process".to_string(),
        })?;
        let dir = self.runs.prepare(name, script, fleet_state::store::epoch_secs())?;

        let log_path = dir.join(CONSOLE_LOG);
        let stdout = File::create(&log_path).map_err(DeployError::io(&log_path))?;
        let stderr = stdout.try_clone().map_err(DeployError::io(&log_path))?;

        let mut child = Command::new("sh")
            .arg(START_SCRIPT)
            .current_dir(&dir)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| DeployError::Launch {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| DeployError::Launch {
            name: name.to_string(),
            reason: "process exited before its pid was read".to_string(),
        })?;
        self.runs.write_pid(name, pid)?;

        // Reap the child so a terminated process does not linger as a zombie
        // and keep answering the liveness probe.
        let reaped = name.to_string();
        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(name = %reaped, %status, "process exited"),
                Err(e) => debug!(name = %reaped, error = %e, "wait failed"),
            }
        });

        info!(%name, pid, dir = %dir.display(), "process started");
        Ok(pid)
    }
}
