use async_trait::async_trait;
use sunodo_store::DApp;

use crate::{DriverError, NodeDriver, NodeStatus};

/// Placeholder for backends that are selectable but not built yet.
///
/// Every call fails with [`DriverError::Unsupported`].
pub struct UnimplementedDriver {
    kind: String,
}

impl UnimplementedDriver {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl NodeDriver for UnimplementedDriver {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn start(&self, _dapp: &DApp, _location: &str) -> Result<NodeStatus, DriverError> {
        Err(DriverError::Unsupported(self.kind.clone()))
    }

    async fn stop(&self, _dapp: &DApp) -> Result<NodeStatus, DriverError> {
        Err(DriverError::Unsupported(self.kind.clone()))
    }
}
