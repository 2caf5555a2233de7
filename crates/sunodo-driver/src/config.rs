use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::docker::{DockerCompose, DockerDriver};
use crate::ipfs::IpfsClient;
use crate::k8s::{K8sDriver, KubeClient};
use crate::unimplemented::UnimplementedDriver;
use crate::{DriverError, NodeDriver};

const DEFAULT_IPFS_TIMEOUT: Duration = Duration::from_secs(300);

/// Driver selection, fixed for the lifetime of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    Docker(DockerDriverConfig),
    #[serde(rename = "k8s")]
    Kubernetes(K8sDriverConfig),
    Fly,
}

impl DriverConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverConfig::Docker(_) => "docker",
            DriverConfig::Kubernetes(_) => "k8s",
            DriverConfig::Fly => "fly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerDriverConfig {
    /// Where machine snapshots are unpacked, one directory per location.
    pub machine_dir: PathBuf,
    pub ipfs_url: String,
    pub compose_file: PathBuf,
    /// Defaults to the directory holding the compose file.
    #[serde(default)]
    pub project_directory: Option<PathBuf>,
    /// Passed to each node as `RPC_URL`.
    #[serde(default)]
    pub rpc_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sDriverConfig {
    pub namespace: String,
    /// Cluster API server; in-cluster service address when unset.
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub resource: ResourceDefinition,
}

/// The custom resource describing a DApp node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefinition {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl Default for ResourceDefinition {
    fn default() -> Self {
        Self {
            group: "sunodo.io".into(),
            version: "v1alpha1".into(),
            kind: "DApp".into(),
            plural: "dapps".into(),
        }
    }
}

impl ResourceDefinition {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

pub fn build_driver(config: &DriverConfig) -> Result<Arc<dyn NodeDriver>, DriverError> {
    match config {
        DriverConfig::Docker(docker) => {
            let ipfs_url = Url::parse(&docker.ipfs_url)
                .map_err(|e| DriverError::Config(format!("ipfs url {}: {e}", docker.ipfs_url)))?;
            let content = IpfsClient::new(ipfs_url, DEFAULT_IPFS_TIMEOUT)?;
            let project_directory = docker.project_directory.clone().unwrap_or_else(|| {
                docker
                    .compose_file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
            });
            let compose = DockerCompose::new(docker.compose_file.clone(), project_directory);
            Ok(Arc::new(DockerDriver::new(
                docker.clone(),
                Arc::new(content),
                Arc::new(compose),
            )))
        }
        DriverConfig::Kubernetes(k8s) => {
            let client = KubeClient::from_config(k8s)?;
            Ok(Arc::new(K8sDriver::new(client, k8s.resource.clone())))
        }
        DriverConfig::Fly => Ok(Arc::new(UnimplementedDriver::new("fly"))),
    }
}
