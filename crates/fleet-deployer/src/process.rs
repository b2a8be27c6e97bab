//! Process table over per-process run directories.
//!
//! ```text
//! <run_root>/<name>/
//!   start.sh      launch script (copied template)
//!   started.ts    unix seconds of the launch
//!   app.pid       pid of `sh start.sh`
//!   console.log   stdout + stderr
//!   exit.sh       optional hook, run as `sh exit.sh <name>` on teardown
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

pub const START_SCRIPT: &str = "start.sh";
pub const STARTED_FILE: &str = "started.ts";
pub const PID_FILE: &str = "app.pid";
pub const CONSOLE_LOG: &str = "console.log";
pub const EXIT_HOOK: &str = "exit.sh";

/// Lookup and control of processes launched on this host, by name.
pub trait ProcessTable: Send + Sync {
    fn pid_of(&self, name: &str) -> Option<u32>;

    /// Whether the recorded pid is alive.
    fn is_running(&self, name: &str) -> bool;

    /// Send the termination signal to the recorded pid.
    fn terminate(&self, name: &str) -> DeployResult<()>;

    /// Run the exit hook if one exists. Returns whether a hook ran.
    fn run_exit_hook(&self, name: &str) -> DeployResult<bool>;

    /// Remove the process's working directory.
    fn remove(&self, name: &str) -> DeployResult<()>;

    /// Names of every process with a working directory.
    fn list(&self) -> DeployResult<Vec<String>>;

    /// Unix seconds of the launch, if recorded.
    fn started_at(&self, name: &str) -> Option<u64>;
}

/// The on-disk process table rooted at `run_root`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create a fresh run directory holding `start.sh` and `started.ts`.
    pub fn prepare(&self, name: &str, template: &Path, now: u64) -> DeployResult<PathBuf> {
        let dir = self.dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(DeployError::io(&dir))?;
        }
        fs::create_dir_all(&dir).map_err(DeployError::io(&dir))?;
        fs::copy(template, dir.join(START_SCRIPT)).map_err(DeployError::io(template))?;
        let started = dir.join(STARTED_FILE);
        fs::write(&started, now.to_string()).map_err(DeployError::io(&started))?;
        Ok(dir)
    }

    pub fn write_pid(&self, name: &str, pid: u32) -> DeployResult<()> {
        let path = self.dir(name).join(PID_FILE);
        fs::write(&path, pid.to_string()).map_err(DeployError::io(&path))
    }

    fn read_number<T: std::str::FromStr>(&self, name: &str, file: &str) -> Option<T> {
        fs::read_to_string(self.dir(name).join(file))
            .ok()
            .and_then(|s| s.lines().next().and_then(|l| l.trim().parse().ok()))
    }
}

/// `kill(pid, sig)`, mapping failure to the OS error.
fn signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(std::io::Error::from(ErrorKind::InvalidInput));
    };
    // pid 0 and negative pids address process groups.
    if pid <= 0 {
        return Err(std::io::Error::from(ErrorKind::InvalidInput));
    }
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl ProcessTable for RunDirectory {
    fn pid_of(&self, name: &str) -> Option<u32> {
        self.read_number(name, PID_FILE)
    }

    fn is_running(&self, name: &str) -> bool {
        let Some(pid) = self.pid_of(name) else {
            return false;
        };
        match signal(pid, 0) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(e) => e.raw_os_error() == Some(libc::EPERM),
        }
    }

    fn terminate(&self, name: &str) -> DeployResult<()> {
        let pid_path = self.dir(name).join(PID_FILE);
        let Some(pid) = self.pid_of(name) else {
            return Err(DeployError::Io {
                path: pid_path,
                source: std::io::Error::from(ErrorKind::NotFound),
            });
        };
        match signal(pid, libc::SIGTERM) {
            Ok(()) => {
                debug!(%name, pid, "sent SIGTERM");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                debug!(%name, pid, "process already gone");
                Ok(())
            }
            Err(source) => Err(DeployError::Io {
                path: pid_path,
                source,
            }),
        }
    }

    fn run_exit_hook(&self, name: &str) -> DeployResult<bool> {
        let dir = self.dir(name);
        if !dir.join(EXIT_HOOK).is_file() {
            return Ok(false);
        }
        let status = Command::new("sh")
            .arg(EXIT_HOOK)
            .arg(name)
            .current_dir(&dir)
            .status()
            .map_err(DeployError::io(dir.join(EXIT_HOOK)))?;
        if !status.success() {
            warn!(%name, %status, "exit hook returned failure");
        }
        Ok(true)
    }

    fn remove(&self, name: &str) -> DeployResult<()> {
        let dir = self.dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DeployError::Io { path: dir, source }),
        }
    }

    fn list(&self) -> DeployResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DeployError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(DeployError::io(&self.root))?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn started_at(&self, name: &str) -> Option<u64> {
        self.read_number(name, STARTED_FILE)
    }
}
