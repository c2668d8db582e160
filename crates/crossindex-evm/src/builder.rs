//! Fluent builder for [`ChainWatcher`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crossindex_core::{DecoderRegistry, MemoryCheckpointStore, RecordingSink};
//! use crossindex_evm::{ChainWatcherBuilder, HttpRpcClient};
//! use tokio::sync::mpsc;
//!
//! let (tx, _rx) = mpsc::channel(16);
//! let client = HttpRpcClient::new("http://localhost:8545", std::time::Duration::from_secs(10)).unwrap();
//! let watcher = ChainWatcherBuilder::new(1, "ethereum")
//!     .confirmation_depth(12)
//!     .max_block_range(500)
//!     .rate_limit(5.0)
//!     .client(Arc::new(client))
//!     .registry(DecoderRegistry::new())
//!     .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
//!     .anomaly_sink(Arc::new(RecordingSink::new()))
//!     .events(tx)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crossindex_core::policy::RetryConfig;
use crossindex_core::{
    AnomalySink, ChainConfig, CheckpointManager, CheckpointStore, DecoderRegistry, IndexerError,
};
use crossindex_observability::CrossIndexMetrics;

use crate::fetcher::{EvmFetcher, EvmRpcClient};
use crate::watcher::{ChainWatcher, EventBatch};

/// Default checkpoint namespace.
pub const DEFAULT_INDEXER_ID: &str = "crossindex";

pub struct ChainWatcherBuilder {
    config: ChainConfig,
    indexer_id: String,
    client: Option<Arc<dyn EvmRpcClient>>,
    registry: Option<DecoderRegistry>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    sink: Option<Arc<dyn AnomalySink>>,
    metrics: Option<CrossIndexMetrics>,
    events: Option<mpsc::Sender<EventBatch>>,
}

impl ChainWatcherBuilder {
    pub fn new(chain_id: u64, name: impl Into<String>) -> Self {
        Self::from_config(ChainConfig::new(chain_id, name))
    }

    pub fn from_config(config: ChainConfig) -> Self {
        Self {
            config,
            indexer_id: DEFAULT_INDEXER_ID.to_string(),
            client: None,
            registry: None,
            checkpoints: None,
            sink: None,
            metrics: None,
            events: None,
        }
    }

    /// Checkpoint key namespace.
    pub fn indexer_id(mut self, id: impl Into<String>) -> Self {
        self.indexer_id = id.into();
        self
    }

    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Maximum blocks per `eth_getLogs` call.
    pub fn max_block_range(mut self, range: u64) -> Self {
        self.config.max_block_range = range;
        self
    }

    /// Maximum blocks advanced per tick.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// RPC calls per second.
    pub fn rate_limit(mut self, per_second: f64) -> Self {
        self.config.rate_limit = per_second;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: RetryConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn client(mut self, client: Arc<dyn EvmRpcClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn anomaly_sink(mut self, sink: Arc<dyn AnomalySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to instruments on the global meter provider.
    pub fn metrics(mut self, metrics: CrossIndexMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Channel to the normalizer.
    pub fn events(mut self, tx: mpsc::Sender<EventBatch>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn build(self) -> Result<ChainWatcher, IndexerError> {
        fn missing(what: &str) -> IndexerError {
            IndexerError::Other(format!("chain watcher needs {what}"))
        }
        if self.config.max_block_range == 0 {
            return Err(IndexerError::Other("max_block_range must be positive".into()));
        }
        if self.config.rate_limit <= 0.0 {
            return Err(IndexerError::Other("rate_limit must be positive".into()));
        }

        let client = self.client.ok_or_else(|| missing("an RPC client"))?;
        let checkpoints = self.checkpoints.ok_or_else(|| missing("a checkpoint store"))?;
        let sink = self.sink.ok_or_else(|| missing("an anomaly sink"))?;
        let events = self.events.ok_or_else(|| missing("an event channel"))?;

        let fetcher = EvmFetcher::new(client, self.config.rate_limit, self.config.request_timeout);
        let checkpoint = CheckpointManager::new(checkpoints, self.config.chain_id, self.indexer_id);
        Ok(ChainWatcher::new(
            self.config,
            fetcher,
            self.registry.unwrap_or_default(),
            checkpoint,
            sink,
            self.metrics.unwrap_or_else(CrossIndexMetrics::global),
            events,
        ))
    }
}
