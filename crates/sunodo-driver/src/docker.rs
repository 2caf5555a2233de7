//! Local driver: one `docker compose` project per DApp.
//!
//! Starting a node pins and downloads the machine snapshot, unpacks it under
//! the machine directory and brings the compose stack up detached, scoped to
//! a project named after the DApp address.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use sunodo_store::{Address, DApp};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DockerDriverConfig;
use crate::ipfs::ContentStore;
use crate::{DriverError, NodeDriver, NodeStatus, io_error, node_name};

/// A compose project invocation: its name and the environment it runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait ComposeRunner: Send + Sync {
    async fn up(&self, project: &ComposeProject) -> Result<(), DriverError>;
    async fn down(&self, project: &ComposeProject) -> Result<(), DriverError>;
}

/// Runs the `docker compose` CLI.
pub struct DockerCompose {
    program: String,
    compose_file: PathBuf,
    project_directory: PathBuf,
}

impl DockerCompose {
    pub fn new(compose_file: PathBuf, project_directory: PathBuf) -> Self {
        Self {
            program: "docker".into(),
            compose_file,
            project_directory,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(
        &self,
        project: &ComposeProject,
        action: &'static str,
        args: &[&str],
    ) -> Result<(), DriverError> {
        let output = Command::new(&self.program)
            .arg("compose")
            .arg("--file")
            .arg(&self.compose_file)
            .arg("--project-directory")
            .arg(&self.project_directory)
            .arg("--project-name")
            .arg(&project.name)
            .args(args)
            .envs(&project.env)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DriverError::Compose {
                project: project.name.clone(),
                action,
                message: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::Compose {
                project: project.name.clone(),
                action,
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ComposeRunner for DockerCompose {
    async fn up(&self, project: &ComposeProject) -> Result<(), DriverError> {
        self.run(project, "up", &["up", "--detach"]).await
    }

    async fn down(&self, project: &ComposeProject) -> Result<(), DriverError> {
        self.run(project, "down", &["down"]).await
    }
}

pub struct DockerDriver {
    config: DockerDriverConfig,
    content: Arc<dyn ContentStore>,
    compose: Arc<dyn ComposeRunner>,
    nodes: Mutex<HashMap<Address, NodeStatus>>,
}

/// Locations become directory names, so only plain CID characters are accepted.
fn validate_location(location: &str) -> Result<(), DriverError> {
    if location.is_empty() || !location.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DriverError::InvalidLocation(location.to_string()));
    }
    Ok(())
}

/// Unpack a gzip-compressed tar archive into `target`, all or nothing.
///
/// The archive is extracted into a sibling temporary directory which is
/// renamed into place once complete.
pub fn unpack_archive(archive: &[u8], target: &Path) -> Result<(), DriverError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .map_err(|e| io_error(parent, e))?;

    let mut tar = tar::Archive::new(GzDecoder::new(Cursor::new(archive)));
    tar.unpack(staging.path()).map_err(|e| DriverError::Unpack {
        path: target.to_path_buf(),
        source: e,
    })?;

    let staged = staging.keep();
    std::fs::rename(&staged, target).map_err(|e| {
        let _ = std::fs::remove_dir_all(&staged);
        io_error(target, e)
    })
}

impl DockerDriver {
    pub fn new(
        config: DockerDriverConfig,
        content: Arc<dyn ContentStore>,
        compose: Arc<dyn ComposeRunner>,
    ) -> Self {
        Self {
            config,
            content,
            compose,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn machine_path(&self, location: &str) -> PathBuf {
        self.config.machine_dir.join(location)
    }

    pub async fn status(&self, address: &Address) -> NodeStatus {
        self.nodes
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or(NodeStatus::Unknown)
    }

    async fn download_machine(&self, location: &str, target: PathBuf) -> Result<(), DriverError> {
        if target.is_dir() {
            debug!(location, path = %target.display(), "machine snapshot already present");
            return Ok(());
        }
        self.content.pin(location).await?;
        let archive: Bytes = self.content.fetch_archive(location).await?;
        tokio::task::spawn_blocking(move || unpack_archive(&archive, &target))
            .await
            .map_err(|e| DriverError::Unpack {
                path: self.machine_path(location),
                source: std::io::Error::other(e),
            })?
    }

    fn project(&self, dapp: &DApp, machine: &Path) -> ComposeProject {
        let mut env = BTreeMap::new();
        env.insert("DAPP_CONTRACT_ADDRESS".to_string(), dapp.address.to_string());
        env.insert("SNAPSHOT_DIR".to_string(), machine.display().to_string());
        if let Some(rpc_url) = &self.config.rpc_url {
            env.insert("RPC_URL".to_string(), rpc_url.clone());
        }
        ComposeProject {
            name: node_name(&dapp.address),
            env,
        }
    }
}

#[async_trait]
impl NodeDriver for DockerDriver {
    fn kind(&self) -> &str {
        "docker"
    }

    async fn start(&self, dapp: &DApp, location: &str) -> Result<NodeStatus, DriverError> {
        validate_location(location)?;
        info!(address = %dapp.address, location, "starting node");

        let machine = self.machine_path(location);
        self.download_machine(location, machine.clone()).await?;

        let project = self.project(dapp, &machine);
        self.compose.up(&project).await?;
        self.nodes.lock().await.insert(dapp.address, NodeStatus::Started);
        Ok(NodeStatus::Starting)
    }

    async fn stop(&self, dapp: &DApp) -> Result<NodeStatus, DriverError> {
        // Projects started before a restart are not in `nodes`; `down` on a
        // project that does not exist succeeds.
        let current = self.status(&dapp.address).await;
        info!(address = %dapp.address, status = %current, "stopping node");
        let project = ComposeProject {
            name: node_name(&dapp.address),
            env: BTreeMap::new(),
        };
        self.compose.down(&project).await?;
        self.nodes.lock().await.insert(dapp.address, NodeStatus::Stopped);
        Ok(match current {
            NodeStatus::Started => NodeStatus::Stopping,
            _ => NodeStatus::Stopped,
        })
    }
}
