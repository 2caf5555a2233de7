//! Node lifecycle controller.
//!
//! Watches the chain for funding deadlines and machine locations, keeps them
//! in a [`DAppStore`](sunodo_store::DAppStore) and starts or stops DApp nodes
//! through a [`NodeDriver`](sunodo_driver::NodeDriver) as deadlines are set
//! and crossed.

mod config;
mod controller;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::ControllerConfig;
pub use controller::{Contracts, Controller, TickReport};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] sunodo_store::StoreError),
    #[error(transparent)]
    Chain(#[from] sunodo_chain::ChainError),
    #[error(transparent)]
    Driver(#[from] sunodo_driver::DriverError),
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
