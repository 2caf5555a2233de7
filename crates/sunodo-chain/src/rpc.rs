use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sunodo_store::Address;
use tracing::{debug, warn};
use url::Url;

use crate::{ChainClient, ChainError, EventKind, FilterId, RawLog};

/// Poll interval used when none is configured, matching common client defaults.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(4);

/// [`ChainClient`] speaking Ethereum JSON-RPC over HTTP.
pub struct RpcChainClient {
    client: reqwest::Client,
    url: Url,
    polling_interval: Duration,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLog {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    block_hash: Option<String>,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RpcChainClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let response: RpcResponse = response.json().await?;
        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| ChainError::InvalidResponse(format!("{method}: missing result")))
    }
}

fn is_unknown_filter(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("filter")
        && (message.contains("not found")
            || message.contains("does not exist")
            || message.contains("unknown"))
}

fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::InvalidResponse(format!("quantity without 0x: {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::InvalidResponse(format!("bad quantity {value}: {e}")))
}

fn parse_data(value: &str) -> Result<Vec<u8>, ChainError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| ChainError::InvalidResponse(format!("bad hex data: {e}")))
}

fn parse_topic(value: &str) -> Result<[u8; 32], ChainError> {
    let bytes = parse_data(value)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ChainError::InvalidResponse(format!("topic is not 32 bytes: {value}")))
}

impl TryFrom<WireLog> for RawLog {
    type Error = ChainError;

    fn try_from(wire: WireLog) -> Result<Self, Self::Error> {
        let address = wire
            .address
            .as_deref()
            .map(str::parse::<Address>)
            .transpose()
            .map_err(|e| ChainError::InvalidResponse(format!("bad log address: {e}")))?;
        let topics = wire
            .topics
            .iter()
            .map(|t| parse_topic(t))
            .collect::<Result<Vec<_>, _>>()?;
        let data = match wire.data.as_deref() {
            Some(data) => parse_data(data)?,
            None => Vec::new(),
        };
        let block_number = wire.block_number.as_deref().map(parse_quantity).transpose()?;
        Ok(RawLog {
            address,
            topics,
            data,
            block_number,
            block_hash: wire.block_hash,
            transaction_hash: wire.transaction_hash,
        })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        let value = self.call("eth_chainId", json!([])).await?;
        let quantity = value
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("eth_chainId returned {value}")))?;
        parse_quantity(quantity)
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    async fn create_filter(
        &self,
        kind: EventKind,
        contract: Address,
        from_block: u64,
    ) -> Result<FilterId, ChainError> {
        let params = json!([{
            "address": contract.to_string(),
            "topics": [format!("0x{}", hex::encode(kind.topic()))],
            "fromBlock": format!("0x{from_block:x}"),
        }]);
        let value = self.call("eth_newFilter", params).await?;
        let id = value
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("eth_newFilter returned {value}")))?;
        debug!(event = kind.name(), %contract, from_block, filter = id, "filter created");
        Ok(FilterId(id.to_string()))
    }

    async fn poll_filter(&self, filter: &FilterId) -> Result<Vec<RawLog>, ChainError> {
        self.filter_query("eth_getFilterChanges", filter).await
    }

    async fn filter_logs(&self, filter: &FilterId) -> Result<Vec<RawLog>, ChainError> {
        self.filter_query("eth_getFilterLogs", filter).await
    }
}

impl RpcChainClient {
    async fn filter_query(&self, method: &str, filter: &FilterId) -> Result<Vec<RawLog>, ChainError> {
        let value = match self.call(method, json!([filter.0])).await {
            Ok(value) => value,
            Err(ChainError::Rpc { message, .. }) if is_unknown_filter(&message) => {
                return Err(ChainError::FilterNotFound(filter.clone()));
            }
            Err(err) => return Err(err),
        };
        let logs: Vec<WireLog> = serde_json::from_value(value)
            .map_err(|e| ChainError::InvalidResponse(format!("{method}: {e}")))?;
        let logs = logs
            .into_iter()
            .filter(|log| !log.removed)
            .filter_map(|log| match RawLog::try_from(log) {
                Ok(log) => Some(log),
                Err(err) => {
                    warn!(filter = %filter, error = %err, "skipping undecodable log");
                    None
                }
            })
            .collect();
        Ok(logs)
    }
}
