//! Cluster driver: each DApp node is a namespaced custom resource that an
//! in-cluster operator reconciles into pods.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sunodo_store::DApp;
use tracing::{debug, info};
use url::Url;

use crate::config::{K8sDriverConfig, ResourceDefinition};
use crate::{DriverError, NodeDriver, NodeStatus, io_error, node_name};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimal REST client for namespaced custom resources.
pub struct KubeClient {
    client: reqwest::Client,
    base: Url,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(base: Url, namespace: impl Into<String>) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            namespace: namespace.into(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build a client from driver configuration, filling gaps from the pod's
    /// service account when running inside the cluster.
    pub fn from_config(config: &K8sDriverConfig) -> Result<Self, DriverError> {
        let base = match &config.api_url {
            Some(url) => url.clone(),
            None => in_cluster_api_url()?,
        };
        let base = Url::parse(&base)
            .map_err(|e| DriverError::Config(format!("cluster api url {base}: {e}")))?;

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token_file = config
            .token_file
            .clone()
            .or_else(|| existing(sa_dir.join("token")));
        let ca_file = config
            .ca_file
            .clone()
            .or_else(|| existing(sa_dir.join("ca.crt")));

        let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(ca_file) = &ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| io_error(ca_file, e))?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }
        let token = match &token_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
                Some(raw.trim().to_string())
            }
            None => None,
        };

        Ok(Self {
            client: builder.build()?,
            base,
            namespace: config.namespace.clone(),
            token,
        })
    }

    fn collection(&self, resource: &ResourceDefinition) -> Result<Url, DriverError> {
        let path = format!(
            "apis/{}/{}/namespaces/{}/{}",
            resource.group, resource.version, self.namespace, resource.plural
        );
        self.base
            .join(&path)
            .map_err(|e| DriverError::Config(format!("cluster api path {path}: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn create(&self, resource: &ResourceDefinition, body: &Value) -> Result<Value, DriverError> {
        let url = self.collection(resource)?;
        let response = self.authorize(self.client.post(url)).json(body).send().await?;
        into_json(response).await
    }

    fn item(&self, resource: &ResourceDefinition, name: &str) -> Result<Url, DriverError> {
        let mut url = self.collection(resource)?;
        url.path_segments_mut()
            .map_err(|_| DriverError::Config(format!("cluster api url {} cannot be a base", self.base)))?
            .push(name);
        Ok(url)
    }

    pub async fn get(&self, resource: &ResourceDefinition, name: &str) -> Result<Value, DriverError> {
        let url = self.item(resource, name)?;
        let response = self.authorize(self.client.get(url)).send().await?;
        into_json(response).await
    }

    /// Apply a JSON merge patch to the named resource.
    pub async fn patch(
        &self,
        resource: &ResourceDefinition,
        name: &str,
        patch: &Value,
    ) -> Result<Value, DriverError> {
        let url = self.item(resource, name)?;
        let request = self
            .client
            .patch(url)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(patch.to_string());
        let response = self.authorize(request).send().await?;
        into_json(response).await
    }

    pub async fn delete(&self, resource: &ResourceDefinition, name: &str) -> Result<Value, DriverError> {
        let url = self.item(resource, name)?;
        let response = self.authorize(self.client.delete(url)).send().await?;
        into_json(response).await
    }
}

fn in_cluster_api_url() -> Result<String, DriverError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
        DriverError::Config("no cluster api url given and KUBERNETES_SERVICE_HOST is unset".into())
    })?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}/"))
    } else {
        Ok(format!("https://{host}:{port}/"))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

async fn into_json(response: reqwest::Response) -> Result<Value, DriverError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        // Status objects carry a human readable message; fall back to the raw body.
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        return Err(DriverError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
}

pub struct K8sDriver {
    client: KubeClient,
    resource: ResourceDefinition,
}

impl K8sDriver {
    pub fn new(client: KubeClient, resource: ResourceDefinition) -> Self {
        Self { client, resource }
    }

    /// The custom resource document submitted for `dapp`.
    pub fn manifest(&self, dapp: &DApp, location: &str) -> Value {
        json!({
            "apiVersion": self.resource.api_version(),
            "kind": self.resource.kind,
            "metadata": {
                "name": node_name(&dapp.address),
            },
            "spec": {
                "address": dapp.address.to_string(),
                "blockHash": dapp.block_hash,
                "blockNumber": dapp.block_number.to_string(),
                "transactionHash": dapp.transaction_hash,
                "location": location,
            },
        })
    }

    /// The resource already exists: point it at `location` unless it runs
    /// from there already.
    async fn relocate(&self, dapp: &DApp, location: &str, manifest: &Value) -> Result<NodeStatus, DriverError> {
        let name = node_name(&dapp.address);
        let existing = self.client.get(&self.resource, &name).await?;
        let current = existing["spec"]["location"].as_str();
        if current == Some(location) {
            debug!(address = %dapp.address, location, "node resource already exists");
            return Ok(NodeStatus::Started);
        }
        let patch = json!({ "spec": manifest["spec"].clone() });
        self.client.patch(&self.resource, &name, &patch).await?;
        info!(address = %dapp.address, from = current, to = location, "moved node resource");
        Ok(NodeStatus::Starting)
    }
}

#[async_trait]
impl NodeDriver for K8sDriver {
    fn kind(&self) -> &str {
        "k8s"
    }

    async fn start(&self, dapp: &DApp, location: &str) -> Result<NodeStatus, DriverError> {
        let manifest = self.manifest(dapp, location);
        match self.client.create(&self.resource, &manifest).await {
            Ok(_) => {
                info!(address = %dapp.address, location, "created node resource");
                Ok(NodeStatus::Starting)
            }
            Err(err) if err.is_conflict() => self.relocate(dapp, location, &manifest).await,
            Err(err) => Err(err),
        }
    }

    async fn stop(&self, dapp: &DApp) -> Result<NodeStatus, DriverError> {
        self.client
            .delete(&self.resource, &node_name(&dapp.address))
            .await?;
        info!(address = %dapp.address, "deleted node resource");
        Ok(NodeStatus::Stopping)
    }
}
