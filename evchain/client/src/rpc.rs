use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use evchain_types::proof::TreeProof;
use evchain_types::TxHash;

use crate::error::ClientError;

const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbciInfo {
    pub app_version: u64,
    pub last_block_height: i64,
    #[serde(with = "hex")]
    pub last_block_app_hash: Vec<u8>,
}

fn hex_default<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(raw) => hex::decode(&raw).map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbciQueryResponse {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default, deserialize_with = "hex_default")]
    pub key: Vec<u8>,
    #[serde(default, deserialize_with = "hex_default")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub proof: Option<TreeProof>,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub codespace: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AbciQueryResult {
    response: AbciQueryResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxResultBody {
    #[serde(default)]
    pub code: u32,
    #[serde(default, deserialize_with = "hex_default")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub codespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxResponse {
    pub hash: TxHash,
    pub height: i64,
    pub tx_result: TxResultBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxSearchResponse {
    pub txs: Vec<TxResponse>,
    pub total_count: u64,
}

/// JSON-RPC client for a single chain node.
pub struct RpcClient {
    base_url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::InvalidUrl(base_url));
        }
        let http = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()?;
        Ok(RpcClient {
            base_url,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// The node address this client talks to.
    pub fn remote(&self) -> &str {
        &self.base_url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response: RpcResponse<T> = self
            .http
            .post(&self.base_url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            // "not found" surfaces as a data string on tx lookups.
            if error
                .data
                .as_deref()
                .is_some_and(|data| data.contains("not found"))
            {
                return Err(ClientError::EventNotFound);
            }
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        response.result.ok_or(ClientError::EmptyResponse)
    }

    pub async fn abci_info(&self) -> Result<AbciInfo, ClientError> {
        #[derive(Deserialize)]
        struct InfoResult {
            response: AbciInfo,
        }
        let result: InfoResult = self
            .call("abci_info", serde_json::json!({}), RPC_TIMEOUT)
            .await?;
        Ok(result.response)
    }

    pub async fn abci_query(
        &self,
        path: &str,
        data: &[u8],
        height: i64,
        prove: bool,
    ) -> Result<AbciQueryResponse, ClientError> {
        let params = serde_json::json!({
            "path": path,
            "data": hex::encode(data),
            "height": height.to_string(),
            "prove": prove,
        });
        let result: AbciQueryResult = self.call("abci_query", params, RPC_TIMEOUT).await?;
        Ok(result.response)
    }

    pub async fn tx(&self, hash: &TxHash) -> Result<TxResponse, ClientError> {
        let params = serde_json::json!({
            "hash": hash.to_hex(),
            "prove": false,
        });
        self.call("tx", params, RPC_TIMEOUT).await
    }

    pub async fn tx_search(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<TxSearchResponse, ClientError> {
        let params = serde_json::json!({
            "query": query,
            "prove": false,
            "page": page.to_string(),
            "per_page": per_page.to_string(),
            "order_by": "asc",
        });
        self.call("tx_search", params, SEARCH_TIMEOUT).await
    }
}
