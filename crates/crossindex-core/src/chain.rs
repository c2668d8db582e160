//! Per-chain watcher configuration and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::policy::RetryConfig;

/// Runtime configuration for one chain watcher.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Human-readable name, used in logs.
    pub name: String,
    /// Blocks behind head considered safe from reorgs.
    pub confirmation_depth: u64,
    /// Maximum blocks per `eth_getLogs` call.
    pub max_block_range: u64,
    /// Maximum blocks advanced per tick.
    pub batch_size: u64,
    /// RPC calls per second.
    pub rate_limit: f64,
    /// Sleep between ticks once caught up.
    pub poll_interval: Duration,
    /// First block to scan when no checkpoint exists. `None` starts at the
    /// current safe head.
    pub start_block: Option<u64>,
    /// Per-request RPC timeout.
    pub request_timeout: Duration,
    /// Backoff applied after RPC failures.
    pub backoff: RetryConfig,
}

impl ChainConfig {
    pub fn new(chain_id: u64, name: impl Into<String>) -> Self {
        Self {
            chain_id,
            name: name.into(),
            ..Self::default()
        }
    }

    /// `head - confirmation_depth`, saturating at zero.
    pub fn safe_head(&self, head: u64) -> u64 {
        head.saturating_sub(self.confirmation_depth)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            name: "ethereum".into(),
            confirmation_depth: 12,
            max_block_range: 1000,
            batch_size: 5000,
            rate_limit: 10.0,
            poll_interval: Duration::from_secs(12),
            start_block: None,
            request_timeout: Duration::from_secs(30),
            backoff: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }
}

/// Lifecycle state of a chain watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    /// Constructed but not started.
    Idle,
    /// Behind the safe head; ticking without sleeping.
    Syncing,
    /// Caught up; polling every `poll_interval`.
    Live,
    /// Waiting out an RPC failure before retrying the same range.
    Backoff,
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Live => "live",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
