//! Content-addressed storage used to fetch machine snapshots.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::DriverError;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Keep `location` available on the storage node.
    async fn pin(&self, location: &str) -> Result<(), DriverError>;

    /// Fetch the (gzip-compressed tar) archive stored at `location`.
    async fn fetch_archive(&self, location: &str) -> Result<Bytes, DriverError>;
}

/// Client for the Kubo (go-ipfs) RPC API.
pub struct IpfsClient {
    client: reqwest::Client,
    base: Url,
}

impl IpfsClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, command: &str, location: &str) -> Result<Url, DriverError> {
        let mut url = self
            .base
            .join(&format!("api/v0/{command}"))
            .map_err(|e| DriverError::Config(format!("ipfs url {}: {e}", self.base)))?;
        url.query_pairs_mut().append_pair("arg", location);
        Ok(url)
    }

    async fn post(&self, command: &str, location: &str) -> Result<reqwest::Response, DriverError> {
        let response = self
            .client
            .post(self.endpoint(command, location)?)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::ContentStore(format!(
                "{command} {location} returned {status}: {}",
                body.trim()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ContentStore for IpfsClient {
    async fn pin(&self, location: &str) -> Result<(), DriverError> {
        self.post("pin/add", location).await?;
        debug!(location, "pinned");
        Ok(())
    }

    async fn fetch_archive(&self, location: &str) -> Result<Bytes, DriverError> {
        let bytes = self.post("cat", location).await?.bytes().await?;
        debug!(location, size = bytes.len(), "fetched archive");
        Ok(bytes)
    }
}
