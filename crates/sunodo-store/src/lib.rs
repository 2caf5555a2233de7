//! Time-indexed bookkeeping for DApps whose nodes are managed by the controller.
//!
//! The store keeps every known DApp sorted by its shutdown deadline together
//! with a cached partition point (the cursor) separating deadlines that have
//! already passed from those still in the future. It also remembers the last
//! announced machine snapshot location per DApp and the highest chain block
//! folded in, which is the resume point after a restart.

mod address;
mod dapp;
pub mod decimal;
mod snapshot;
mod store;

pub use address::{Address, AddressParseError};
pub use dapp::DApp;
pub use snapshot::StoreSnapshot;
pub use store::DAppStore;

use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to persist snapshot to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
