//! Recording fakes for the launch executor and the process table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::env::LaunchEnv;
use crate::error::{DeployError, DeployResult};
use crate::executor::LaunchExecutor;
use crate::process::ProcessTable;

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProc {
    pub pid: u32,
    pub running: bool,
    pub started_at: u64,
    pub exit_hook: bool,
}

/// In-memory process table.
#[derive(Default)]
pub(crate) struct FakeProcesses {
    pub procs: Mutex<BTreeMap<String, FakeProc>>,
    pub fail_signal: bool,
}

impl FakeProcesses {
    pub(crate) fn insert(&self, name: &str, proc: FakeProc) {
        self.procs.lock().unwrap().insert(name.to_string(), proc);
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.procs.lock().unwrap().contains_key(name)
    }
}

impl ProcessTable for FakeProcesses {
    fn pid_of(&self, name: &str) -> Option<u32> {
        self.procs.lock().unwrap().get(name).map(|p| p.pid)
    }

    fn is_running(&self, name: &str) -> bool {
        self.procs
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|p| p.running)
    }

    fn terminate(&self, name: &str) -> DeployResult<()> {
        if self.fail_signal {
            return Err(DeployError::Launch {
                name: name.to_string(),
                reason: "signal refused".to_string(),
            });
        }
        if let Some(p) = self.procs.lock().unwrap().get_mut(name) {
            p.running = false;
        }
        Ok(())
    }

    fn run_exit_hook(&self, name: &str) -> DeployResult<bool> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|p| p.exit_hook))
    }

    fn remove(&self, name: &str) -> DeployResult<()> {
        self.procs.lock().unwrap().remove(name);
        Ok(())
    }

    fn list(&self) -> DeployResult<Vec<String>> {
        Ok(self.procs.lock().unwrap().keys().cloned().collect())
    }

    fn started_at(&self, name: &str) -> Option<u64> {
        self.procs.lock().unwrap().get(name).map(|p| p.started_at)
    }
}

/// Records every launch and marks it running in the shared process table.
pub(crate) struct FakeExecutor {
    pub processes: Arc<FakeProcesses>,
    pub launches: Mutex<Vec<(String, PathBuf, LaunchEnv)>>,
    pub fail: bool,
    next_pid: AtomicU32,
}

impl FakeExecutor {
    pub(crate) fn new(processes: Arc<FakeProcesses>) -> Self {
        Self {
            processes,
            launches: Mutex::new(Vec::new()),
            fail: false,
            next_pid: AtomicU32::new(100),
        }
    }

    pub(crate) fn failing(processes: Arc<FakeProcesses>) -> Self {
        Self {
            fail: true,
            ..Self::new(processes)
        }
    }

    pub(crate) fn launched(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub(crate) fn env_of(&self, name: &str) -> Option<LaunchEnv> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, env)| env.clone())
    }
}

impl LaunchExecutor for FakeExecutor {
    fn launch(&self, name: &str, script: &Path, env: &LaunchEnv) -> DeployResult<u32> {
        if self.fail {
            return Err(DeployError::Launch {
                name: name.to_string(),
                reason: "executor refused".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.launches
            .lock()
            .unwrap()
            .push((name.to_string(), script.to_path_buf(), env.clone()));
        self.processes.insert(
            name,
            FakeProc {
                pid,
                running: true,
                started_at: fleet_state::store::epoch_secs(),
                exit_hook: false,
            },
        );
        Ok(pid)
    }
}
