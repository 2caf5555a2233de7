//! Node drivers: the backends that actually run (and stop) DApp nodes.
//!
//! The controller decides *when* a node should run; a [`NodeDriver`] decides
//! *how*. Which driver is used is fixed at startup by [`DriverConfig`].

pub mod config;
pub mod docker;
pub mod ipfs;
pub mod k8s;
mod unimplemented;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sunodo_store::{Address, DApp};

pub use config::{DockerDriverConfig, DriverConfig, K8sDriverConfig, ResourceDefinition, build_driver};
pub use docker::{ComposeProject, ComposeRunner, DockerCompose, DockerDriver};
pub use ipfs::{ContentStore, IpfsClient};
pub use k8s::{K8sDriver, KubeClient};
pub use unimplemented::UnimplementedDriver;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unsupported driver: {0}")]
    Unsupported(String),
    #[error("invalid driver configuration: {0}")]
    Config(String),
    #[error("invalid machine location {0:?}")]
    InvalidLocation(String),
    #[error("content store error: {0}")]
    ContentStore(String),
    #[error("failed to unpack machine snapshot into {path:?}: {source}")]
    Unpack {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("compose {action} for project {project} failed: {message}")]
    Compose {
        project: String,
        action: &'static str,
        message: String,
    },
    #[error("cluster api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

impl DriverError {
    /// The cluster reported that the resource already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DriverError::Api { status: 409, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::Api { status: 404, .. })
    }
}

/// Last known state of a managed node, as reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Starting => "starting",
            NodeStatus::Started => "started",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Error => "error",
            NodeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait NodeDriver: Send + Sync {
    fn kind(&self) -> &str;

    /// Bring up the node for `dapp` from the machine snapshot at `location`.
    async fn start(&self, dapp: &DApp, location: &str) -> Result<NodeStatus, DriverError>;

    async fn stop(&self, dapp: &DApp) -> Result<NodeStatus, DriverError>;
}

/// Deterministic per-DApp name for compose projects and cluster resources.
pub fn node_name(address: &Address) -> String {
    format!("dapp-{}", address.to_hex())
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> DriverError {
    DriverError::Io {
        path: path.into(),
        source: err,
    }
}
