use serde::{Deserialize, Serialize};

use crate::Address;

/// A DApp whose node lifetime is bounded by an on-chain funding deadline.
///
/// Provenance fields record the log that last set the deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DApp {
    pub address: Address,
    /// Milliseconds since the Unix epoch at which the node must be shut down.
    #[serde(with = "crate::decimal")]
    pub shutdown_at: u128,
    #[serde(default)]
    pub block_hash: String,
    #[serde(with = "crate::decimal", default)]
    pub block_number: u64,
    #[serde(default)]
    pub transaction_hash: String,
}

impl DApp {
    /// DApp with empty provenance, handy for tests and manual seeding.
    pub fn new(address: Address, shutdown_at: u128) -> Self {
        Self {
            address,
            shutdown_at,
            block_hash: String::new(),
            block_number: 0,
            transaction_hash: String::new(),
        }
    }

    /// Whether the deadline is still ahead of `now` (milliseconds epoch).
    pub fn is_live(&self, now: u128) -> bool {
        self.shutdown_at > now
    }
}
