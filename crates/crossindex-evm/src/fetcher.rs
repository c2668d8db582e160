//! EVM log fetcher.
//!
//! Wraps an [`EvmRpcClient`] with the per-chain rate limiter and request
//! timeout, splits block ranges into `max_block_range` chunks, and turns wire
//! logs into [`ChainLog`]s with their block timestamps filled in.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crossindex_core::policy::{RateLimiter, RateLimiterConfig};
use crossindex_core::{ChainLog, DecodeError, IndexerError};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    /// Some providers include the block timestamp on each log.
    #[serde(rename = "blockTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Option<u32> {
        parse_hex_u64(&self.log_index).and_then(|i| u32::try_from(i).ok())
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Convert to a [`ChainLog`], normalizing hex strings to lowercase.
    pub fn into_chain_log(self, block_timestamp: i64) -> Result<ChainLog, MalformedLog> {
        let malformed = |field: &'static str, reason: String| MalformedLog {
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            log_index: self.log_index_u32().unwrap_or_default(),
            error: DecodeError::MalformedLog { field, reason },
        };
        let block_number = self
            .block_number_u64()
            .ok_or_else(|| malformed("blockNumber", format!("not a hex quantity: {:?}", self.block_number)))?;
        let log_index = self
            .log_index_u32()
            .ok_or_else(|| malformed("logIndex", format!("not a hex u32: {:?}", self.log_index)))?;
        let data_hex = self.data.strip_prefix("0x").unwrap_or(&self.data);
        let data = hex::decode(data_hex).map_err(|e| malformed("data", e.to_string()))?;
        Ok(ChainLog {
            block_number,
            log_index,
            removed: self.is_removed(),
            address: self.address.to_ascii_lowercase(),
            topics: self.topics.iter().map(|t| t.to_ascii_lowercase()).collect(),
            data,
            block_hash: self.block_hash.to_ascii_lowercase(),
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            block_timestamp,
        })
    }
}

/// A log the node returned that cannot be turned into a [`ChainLog`].
///
/// One bad log never fails its range; the watcher reports it and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLog {
    pub tx_hash: String,
    /// `0` when the index itself is the malformed field.
    pub log_index: u32,
    pub error: DecodeError,
}

/// Address + topic0 filter for one decoder's `eth_getLogs` query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<String>,
    /// Alternatives for `topic0`; empty matches any event.
    pub topics: Vec<String>,
}

impl LogFilter {
    /// The `eth_getLogs` filter object for `[from, to]`.
    pub fn to_params(&self, from: u64, to: u64) -> Value {
        let mut obj = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "address": self.addresses,
        });
        if !self.topics.is_empty() {
            obj["topics"] = json!([self.topics]);
        }
        obj
    }
}

/// Read-only access to an EVM JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, IndexerError>;
    /// Timestamp of block `number`, or `None` if the node does not have it.
    async fn get_block_timestamp(&self, number: u64) -> Result<Option<i64>, IndexerError>;
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

/// Rate-limited, timeout-bounded access to one chain.
pub struct EvmFetcher {
    client: Arc<dyn EvmRpcClient>,
    limiter: RateLimiter,
    timeout: Duration,
}

impl EvmFetcher {
    pub fn new(client: Arc<dyn EvmRpcClient>, rate_limit: f64, timeout: Duration) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(RateLimiterConfig::per_second(rate_limit)),
            timeout,
        }
    }

    /// Every RPC call goes through here: take a token, then bound the call.
    async fn guarded<T, F>(&self, call: F) -> Result<T, IndexerError>
    where
        F: Future<Output = Result<T, IndexerError>>,
    {
        self.limiter.acquire().await;
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| IndexerError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })?
    }

    /// Current chain head.
    pub async fn head(&self) -> Result<u64, IndexerError> {
        self.guarded(self.client.get_block_number()).await
    }

    /// All logs in `[from, to]` matching `filter`, in one `eth_getLogs` call.
    ///
    /// Block timestamps come from the log when the provider includes them,
    /// otherwise from one `eth_getBlockByNumber` per distinct block. Logs
    /// that cannot be parsed come back as `Err` entries in place; only RPC
    /// failures fail the whole call.
    pub async fn logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<Result<ChainLog, MalformedLog>>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let raw = self
            .guarded(self.client.get_logs(from, to, filter))
            .await?;

        let mut timestamps: HashMap<u64, i64> = HashMap::new();
        let mut out = Vec::with_capacity(raw.len());
        for log in raw {
            let Some(block) = log.block_number_u64() else {
                out.push(log.into_chain_log(0));
                continue;
            };
            let ts = match log.block_timestamp.as_deref().and_then(parse_hex_u64) {
                Some(ts) => ts as i64,
                None => match timestamps.get(&block) {
                    Some(ts) => *ts,
                    None => {
                        let ts = self
                            .guarded(self.client.get_block_timestamp(block))
                            .await?
                            .ok_or_else(|| {
                                IndexerError::Rpc(format!("block {block} not found"))
                            })?;
                        timestamps.insert(block, ts);
                        ts
                    }
                },
            };
            out.push(log.into_chain_log(ts));
        }
        Ok(out)
    }
}

/// Split `[from, to]` into consecutive chunks of at most `max_range` blocks.
pub fn chunks(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let max_range = max_range.max(1);
    let mut out = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(max_range - 1).min(to);
        out.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    out
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}
