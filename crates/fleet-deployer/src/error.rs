//! Deployment error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abandon a single launch job.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown server type: {0}")]
    UnknownServerType(String),

    #[error("unknown routing type: {0}")]
    UnknownRoutingType(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("server type {0} has no dedicated RAM configured")]
    MissingRam(String),

    #[error("every port from {base} to 65535 is in use on node {node}")]
    PortsExhausted { base: u16, node: String },

    #[error("launch of {name} failed: {reason}")]
    Launch { name: String, reason: String },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("bus error: {0}")]
    Bus(#[from] fleet_bus::BusError),
}

pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| DeployError::Io { path, source }
    }
}
