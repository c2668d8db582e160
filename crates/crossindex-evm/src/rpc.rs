//! JSON-RPC 2.0 wire types and the `reqwest`-backed HTTP client.
//!
//! The client is deliberately thin: one request per call, bounded by a
//! timeout. Rate limiting and backoff live in the fetcher and the watcher so
//! that a failed range is retried as a whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crossindex_core::IndexerError;

use crate::fetcher::{parse_hex_u64, EvmRpcClient, LogFilter, RawLog};

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Provider error codes that signal throttling rather than a bad request.
const THROTTLE_CODES: &[i64] = &[-32005, 429];

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("Provider throttled the request: {0}")]
    Throttled(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidResponse(_))
    }
}

impl From<RpcError> for IndexerError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Throttled(msg) => IndexerError::Throttled(msg),
            RpcError::Timeout { ms } => IndexerError::Timeout { ms },
            other => IndexerError::Rpc(other.to_string()),
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// Plain HTTP JSON-RPC client for one endpoint.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Http(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one JSON-RPC call and return its `result`.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout {
                        ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    RpcError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::Throttled(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Http(format!("HTTP {}: {body}", status.as_u16())));
        }

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        body.into_result().map_err(|err| {
            if THROTTLE_CODES.contains(&err.code) {
                RpcError::Throttled(err.message)
            } else {
                RpcError::Rpc {
                    code: err.code,
                    message: err.message,
                }
            }
        })
    }
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn get_block_number(&self) -> Result<u64, IndexerError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        let s = v
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_blockNumber returned {v}")))?;
        parse_hex_u64(s)
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_blockNumber returned {s}")).into())
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<Option<i64>, IndexerError> {
        let v = self
            .call(
                "eth_getBlockByNumber",
                vec![json!(format!("0x{number:x}")), json!(false)],
            )
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        let ts = v["timestamp"]
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse(format!("block {number} has no timestamp")))?;
        let ts = parse_hex_u64(ts).ok_or_else(|| {
            RpcError::InvalidResponse(format!("block {number} has timestamp {ts}"))
        })?;
        Ok(Some(ts as i64))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let v = self.call("eth_getLogs", vec![filter.to_params(from, to)]).await?;
        serde_json::from_value(v)
            .map_err(|e| RpcError::InvalidResponse(format!("eth_getLogs: {e}")).into())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": result,
        }))
    }

    async fn client(server: &MockServer) -> HttpRpcClient {
        HttpRpcClient::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
        assert!(json.contains("\"id\":7"));
    }

    #[tokio::test]
    async fn block_number_parses_hex() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
            .respond_with(ok(json!("0x1b4")))
            .mount(&server)
            .await;

        assert_eq!(client(&server).await.get_block_number().await.unwrap(), 436);
    }

    #[tokio::test]
    async fn get_logs_sends_filter_and_parses_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_getLogs",
                "params": [{ "fromBlock": "0x64", "toBlock": "0xc8" }]
            })))
            .respond_with(ok(json!([{
                "address": "0x00000000000000000000000000000000000000aa",
                "topics": ["0x01"],
                "data": "0x",
                "blockNumber": "0x65",
                "blockHash": "0xbb",
                "transactionHash": "0xcc",
                "logIndex": "0x2",
                "removed": false
            }])))
            .mount(&server)
            .await;

        let filter = LogFilter {
            addresses: vec!["0x00000000000000000000000000000000000000aa".into()],
            topics: vec!["0x01".into()],
        };
        let logs = client(&server).await.get_logs(100, 200, &filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number_u64(), Some(101));
        assert_eq!(logs[0].log_index_u32(), Some(2));
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok(Value::Null))
            .mount(&server)
            .await;
        assert_eq!(client(&server).await.get_block_timestamp(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn http_429_is_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server).await.get_block_number().await.unwrap_err();
        assert!(matches!(err, IndexerError::Throttled(_)), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rpc_limit_error_is_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32005, "message": "limit exceeded" }
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.get_block_number().await.unwrap_err();
        assert!(matches!(err, IndexerError::Throttled(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok(json!("0x1")).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = HttpRpcClient::new(server.uri(), Duration::from_millis(50)).unwrap();
        let err = client.get_block_number().await.unwrap_err();
        assert!(matches!(err, IndexerError::Timeout { .. }), "got {err:?}");
    }
}
