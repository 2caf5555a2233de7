//! Chain watching for the node controller.
//!
//! [`ChainClient`] is the seam to the blockchain: it creates log filters for
//! the two protocol events and polls them for new entries. [`RpcChainClient`]
//! implements it over Ethereum JSON-RPC. The [`ingest`] module turns raw logs
//! into typed events and folds them into a [`sunodo_store::DAppStore`].

pub mod abi;
pub mod ingest;
mod rpc;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sunodo_store::Address;

pub use abi::EventKind;
pub use ingest::{DeadlineEvent, IngestError, LocationEvent};
pub use rpc::{DEFAULT_POLLING_INTERVAL, RpcChainClient};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("filter {0} is no longer known to the node")]
    FilterNotFound(FilterId),
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

/// Handle of a log filter installed on the chain node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterId(pub String);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An undecoded log entry as returned by a filter poll.
///
/// `block_number` is `None` for logs from pending blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLog {
    pub address: Option<Address>,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub transaction_hash: Option<String>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    /// Recommended interval between filter polls.
    fn polling_interval(&self) -> Duration;

    async fn create_filter(
        &self,
        kind: EventKind,
        contract: Address,
        from_block: u64,
    ) -> Result<FilterId, ChainError>;

    /// Logs matched since the previous poll of `filter`.
    async fn poll_filter(&self, filter: &FilterId) -> Result<Vec<RawLog>, ChainError>;

    /// Every log matching `filter` from its starting block on. Used once
    /// after a filter is installed to catch up on history.
    async fn filter_logs(&self, filter: &FilterId) -> Result<Vec<RawLog>, ChainError>;
}
