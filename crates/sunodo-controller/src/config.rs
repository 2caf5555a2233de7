use std::path::PathBuf;
use std::time::Duration;

use sunodo_driver::DriverConfig;
use sunodo_store::Address;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub rpc_url: String,
    /// Root for persisted state: `<data_dir>/<chain id>/data.json`.
    pub data_dir: PathBuf,
    /// Contract emitting `FinancialRunway` events.
    pub financial_protocol: Option<Address>,
    /// Contract emitting `MachineLocation` events.
    pub machine_protocol: Option<Address>,
    /// Overrides the chain client's recommended polling interval.
    pub poll_interval: Option<Duration>,
    pub rpc_timeout: Duration,
    pub driver: DriverConfig,
    /// Upper bound for a single driver start or stop.
    pub driver_timeout: Duration,
    /// Write a snapshot after every tick that changed the store. When false,
    /// the store is only written on shutdown.
    pub persist_every_tick: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            data_dir: PathBuf::from("."),
            financial_protocol: None,
            machine_protocol: None,
            poll_interval: None,
            rpc_timeout: Duration::from_secs(30),
            driver: DriverConfig::Fly,
            driver_timeout: Duration::from_secs(120),
            persist_every_tick: true,
        }
    }
}

impl ControllerConfig {
    pub fn store_path(&self, chain_id: u64) -> PathBuf {
        self.data_dir.join(chain_id.to_string()).join("data.json")
    }

    pub fn machine_dir(&self) -> PathBuf {
        self.data_dir.join("machine")
    }
}
