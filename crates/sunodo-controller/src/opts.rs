//! Command line options. Every flag can also be set through a `SUNODO_*`
//! environment variable (or a `.env` file in the working directory).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sunodo_controller::ControllerConfig;
use sunodo_driver::{DockerDriverConfig, DriverConfig, K8sDriverConfig, ResourceDefinition};
use sunodo_store::Address;

#[derive(Parser, Debug)]
#[command(
    name = "sunodo-controller",
    version,
    about = "Starts and stops DApp nodes as their on-chain funding comes and goes"
)]
pub struct Cli {
    /// Chain JSON-RPC endpoint
    #[arg(short = 'r', long, env = "SUNODO_RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// IPFS (Kubo) RPC endpoint used to fetch machine snapshots
    #[arg(long, env = "SUNODO_IPFS", default_value = "http://127.0.0.1:5001")]
    pub ipfs: String,

    /// Backend that runs the nodes
    #[arg(long, value_enum, env = "SUNODO_DRIVER", default_value_t = DriverKind::Docker)]
    pub driver: DriverKind,

    /// Address of the contract emitting FinancialRunway events
    #[arg(long, env = "SUNODO_FINANCIAL_PROTOCOL")]
    pub financial_protocol: Option<Address>,

    /// Address of the contract emitting MachineLocation events
    #[arg(long, env = "SUNODO_MACHINE_PROTOCOL")]
    pub machine_protocol: Option<Address>,

    /// State directory (default: $XDG_DATA_HOME/sunodo)
    #[arg(long, env = "SUNODO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Compose file describing a node (docker driver)
    #[arg(long, env = "SUNODO_COMPOSE_FILE", default_value = "compose.yaml")]
    pub compose_file: PathBuf,

    /// Namespace for node resources (k8s driver)
    #[arg(long, env = "SUNODO_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Cluster API server; in-cluster address when unset (k8s driver)
    #[arg(long, env = "SUNODO_K8S_API_URL")]
    pub k8s_api_url: Option<String>,

    /// Bearer token file (k8s driver)
    #[arg(long, env = "SUNODO_K8S_TOKEN_FILE")]
    pub k8s_token_file: Option<PathBuf>,

    /// CA certificate for the cluster API (k8s driver)
    #[arg(long, env = "SUNODO_K8S_CA_FILE")]
    pub k8s_ca_file: Option<PathBuf>,

    /// Override the chain polling interval (milliseconds)
    #[arg(long, env = "SUNODO_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Upper bound for a single node start or stop (milliseconds)
    #[arg(long, env = "SUNODO_DRIVER_TIMEOUT_MS", default_value_t = 120_000)]
    pub driver_timeout_ms: u64,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, env = "SUNODO_VERBOSE")]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Docker,
    K8s,
    Fly,
}

impl Cli {
    pub fn into_config(self) -> ControllerConfig {
        let data_dir = self.data_dir.unwrap_or_else(default_data_dir);
        let mut config = ControllerConfig {
            rpc_url: self.rpc_url,
            data_dir,
            financial_protocol: self.financial_protocol,
            machine_protocol: self.machine_protocol,
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
            driver_timeout: Duration::from_millis(self.driver_timeout_ms),
            ..Default::default()
        };
        config.driver = match self.driver {
            DriverKind::Docker => DriverConfig::Docker(DockerDriverConfig {
                machine_dir: config.machine_dir(),
                ipfs_url: self.ipfs,
                compose_file: self.compose_file,
                project_directory: None,
                rpc_url: Some(config.rpc_url.clone()),
            }),
            DriverKind::K8s => DriverConfig::Kubernetes(K8sDriverConfig {
                namespace: self.namespace,
                api_url: self.k8s_api_url,
                token_file: self.k8s_token_file,
                ca_file: self.k8s_ca_file,
                resource: ResourceDefinition::default(),
            }),
            DriverKind::Fly => DriverConfig::Fly,
        };
        config
    }
}

fn default_data_dir() -> PathBuf {
    let xdg = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty());
    if let Some(xdg) = xdg {
        return PathBuf::from(xdg).join("sunodo");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/sunodo"),
        None => PathBuf::from(".sunodo"),
    }
}
