//! Chain watcher behaviour against a scripted RPC client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crossindex_core::policy::RetryConfig;
use crossindex_core::{
    Anomaly, ChainLog, CheckpointStore, DecodeError, Decoder, DecoderRegistry, IndexerError,
    MemoryCheckpointStore, RawEvent, RecordingSink, WatcherState,
};
use crossindex_evm::{ChainWatcherBuilder, EventBatch, EvmRpcClient, LogFilter, RawLog};

// ─── Scripted RPC ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedRpc {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    calls: Mutex<Vec<(u64, u64)>>,
    /// 1-based `get_logs` call numbers that fail once.
    fail_calls: Mutex<Vec<usize>>,
}

impl ScriptedRpc {
    fn with_head(head: u64) -> Arc<Self> {
        let rpc = Self::default();
        rpc.head.store(head, Ordering::SeqCst);
        Arc::new(rpc)
    }

    fn add_log(&self, address: &str, topic: &str, block: u64, index: u32, removed: bool) {
        self.logs.lock().unwrap().push(RawLog {
            address: address.into(),
            topics: vec![topic.into()],
            data: "0x".into(),
            block_number: format!("0x{block:x}"),
            block_hash: format!("0x{block:x}"),
            tx_hash: format!("0x{block:x}{index:02x}"),
            log_index: format!("0x{index:x}"),
            block_timestamp: Some(format!("0x{:x}", block * 12)),
            removed: Some(removed),
        });
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EvmRpcClient for ScriptedRpc {
    async fn get_block_number(&self) -> Result<u64, IndexerError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<Option<i64>, IndexerError> {
        Ok(Some(number as i64 * 12))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((from, to));
            calls.len()
        };
        {
            let mut fail = self.fail_calls.lock().unwrap();
            if let Some(pos) = fail.iter().position(|c| *c == n) {
                fail.remove(pos);
                return Err(IndexerError::Rpc("connection reset".into()));
            }
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| {
                l.block_number_u64().is_some_and(|b| b >= from && b <= to)
                    && filter.addresses.contains(&l.address)
            })
            .cloned()
            .collect())
    }
}

// ─── Test decoder ─────────────────────────────────────────────────────────────

const SENT: &str = "0x01";
const BAD: &str = "0xff";

struct TopicDecoder {
    name: &'static str,
    address: &'static str,
}

impl Decoder for TopicDecoder {
    fn protocol(&self) -> &str {
        self.name
    }

    fn contract_addresses(&self, chain_id: u64) -> Vec<String> {
        if chain_id == 1 {
            vec![self.address.to_string()]
        } else {
            vec![]
        }
    }

    fn event_topics(&self) -> Vec<String> {
        vec![SENT.into(), BAD.into()]
    }

    fn decode(&self, log: &ChainLog, chain_id: u64) -> Result<RawEvent, DecodeError> {
        if log.topic0() == Some(BAD) {
            return Err(DecodeError::MalformedPayload {
                reason: "bad payload".into(),
            });
        }
        Ok(RawEvent {
            protocol: self.name.into(),
            chain_id,
            block_number: log.block_number,
            tx_hash: log.tx_hash.clone(),
            log_index: log.log_index,
            timestamp: log.block_timestamp,
            event_type: "sent".into(),
            data: BTreeMap::new(),
        })
    }
}

fn registry(decoders: Vec<TopicDecoder>) -> DecoderRegistry {
    let reg = DecoderRegistry::new();
    for d in decoders {
        reg.register(Arc::new(d)).unwrap();
    }
    reg
}

fn bridge_x() -> TopicDecoder {
    TopicDecoder {
        name: "bridge_x",
        address: "0xaa",
    }
}

fn fast_backoff() -> RetryConfig {
    RetryConfig {
        max_retries: u32::MAX,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

struct Harness {
    rpc: Arc<ScriptedRpc>,
    checkpoints: Arc<MemoryCheckpointStore>,
    sink: Arc<RecordingSink>,
    rx: mpsc::Receiver<EventBatch>,
    cancel: CancellationToken,
    state: tokio::sync::watch::Receiver<WatcherState>,
    handle: tokio::task::JoinHandle<Result<(), IndexerError>>,
}

fn spawn(
    rpc: Arc<ScriptedRpc>,
    reg: DecoderRegistry,
    configure: impl FnOnce(ChainWatcherBuilder) -> ChainWatcherBuilder,
) -> Harness {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let sink = Arc::new(RecordingSink::new());
    let (tx, rx) = mpsc::channel(4);
    let builder = ChainWatcherBuilder::new(1, "ethereum")
        .confirmation_depth(0)
        .rate_limit(10_000.0)
        .poll_interval(Duration::from_millis(10))
        .backoff(fast_backoff())
        .client(rpc.clone())
        .registry(reg)
        .checkpoint_store(checkpoints.clone())
        .anomaly_sink(sink.clone())
        .events(tx);
    let watcher = configure(builder).build().unwrap();
    let state = watcher.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(watcher.run(cancel.clone()));
    Harness {
        rpc,
        checkpoints,
        sink,
        rx,
        cancel,
        state,
        handle,
    }
}

impl Harness {
    async fn next_batch(&mut self) -> EventBatch {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("watcher closed the channel")
    }

    async fn wait_live(&mut self) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.state.wait_for(|s| *s == WatcherState::Live),
        )
        .await
        .expect("watcher never went live")
        .unwrap();
    }

    async fn checkpoint(&self) -> Option<u64> {
        self.checkpoints
            .load(1, "crossindex")
            .await
            .unwrap()
            .map(|cp| cp.block_number)
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn gap_is_split_into_max_range_chunks() {
    let rpc = ScriptedRpc::with_head(250);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| {
        b.start_block(1).max_block_range(100).batch_size(10_000)
    });

    let batch = h.next_batch().await;
    assert_eq!((batch.from_block, batch.to_block), (1, 250));
    assert_eq!(h.rpc.calls(), vec![(1, 100), (101, 200), (201, 250)]);
    batch.ack.send(()).unwrap();

    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(250));
    h.stop().await;
}

#[tokio::test]
async fn failed_chunk_retries_whole_range_without_advancing() {
    let rpc = ScriptedRpc::with_head(250);
    rpc.fail_calls.lock().unwrap().push(3);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| {
        b.start_block(1).max_block_range(100).batch_size(10_000)
    });

    let batch = h.next_batch().await;
    // The first attempt failed on its third chunk and was retried from the top.
    assert_eq!(
        h.rpc.calls(),
        vec![(1, 100), (101, 200), (201, 250), (1, 100), (101, 200), (201, 250)]
    );
    assert_eq!((batch.from_block, batch.to_block), (1, 250));
    assert_eq!(h.checkpoint().await, Some(0));
    assert_eq!(h.sink.count("watcher_backoff"), 1);

    batch.ack.send(()).unwrap();
    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(250));
    h.stop().await;
}

#[tokio::test]
async fn checkpoint_waits_for_normalizer_ack() {
    let rpc = ScriptedRpc::with_head(50);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| b.start_block(1));

    let batch = h.next_batch().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.checkpoint().await, Some(0), "advanced before ack");

    batch.ack.send(()).unwrap();
    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(50));
    h.stop().await;
}

#[tokio::test]
async fn starts_at_safe_head_and_respects_confirmation_depth() {
    let rpc = ScriptedRpc::with_head(100);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| b.confirmation_depth(12));

    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(88));
    assert!(h.rpc.calls().is_empty(), "no historical backfill without start_block");

    h.rpc.head.store(110, Ordering::SeqCst);
    let batch = h.next_batch().await;
    assert_eq!((batch.from_block, batch.to_block), (89, 98));
    batch.ack.send(()).unwrap();
    h.stop().await;
}

#[tokio::test]
async fn batch_size_bounds_each_tick() {
    let rpc = ScriptedRpc::with_head(300);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| {
        b.start_block(1).batch_size(100).max_block_range(1_000)
    });

    let mut ranges = Vec::new();
    for _ in 0..3 {
        let batch = h.next_batch().await;
        ranges.push((batch.from_block, batch.to_block));
        batch.ack.send(()).unwrap();
    }
    assert_eq!(ranges, vec![(1, 100), (101, 200), (201, 300)]);
    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(300));
    h.stop().await;
}

#[tokio::test]
async fn events_are_ordered_and_bad_logs_skipped() {
    let rpc = ScriptedRpc::with_head(20);
    rpc.add_log("0xbb", SENT, 12, 1, false);
    rpc.add_log("0xaa", SENT, 12, 0, false);
    rpc.add_log("0xaa", SENT, 10, 3, false);
    rpc.add_log("0xaa", BAD, 11, 0, false);
    rpc.add_log("0xbb", SENT, 11, 5, true);
    rpc.add_log("0xcc", SENT, 11, 6, false);

    let reg = registry(vec![
        bridge_x(),
        TopicDecoder {
            name: "bridge_y",
            address: "0xbb",
        },
    ]);
    let mut h = spawn(rpc, reg, |b| b.start_block(1));

    let batch = h.next_batch().await;
    let seen: Vec<_> = batch
        .events
        .iter()
        .map(|e| (e.protocol.as_str(), e.block_number, e.log_index))
        .collect();
    assert_eq!(
        seen,
        vec![("bridge_x", 10, 3), ("bridge_x", 12, 0), ("bridge_y", 12, 1)]
    );
    assert_eq!(batch.events[0].timestamp, 120);
    assert_eq!(h.sink.count("decode_failure"), 1);
    batch.ack.send(()).unwrap();
    h.stop().await;
}

#[tokio::test]
async fn malformed_log_is_reported_and_the_range_still_advances() {
    let rpc = ScriptedRpc::with_head(20);
    rpc.add_log("0xaa", SENT, 10, 0, false);
    rpc.add_log("0xaa", SENT, 11, 0, false);
    rpc.add_log("0xaa", SENT, 12, 0, false);
    rpc.logs.lock().unwrap()[1].data = "0x123".into();

    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| b.start_block(1));

    let batch = h.next_batch().await;
    let blocks: Vec<u64> = batch.events.iter().map(|e| e.block_number).collect();
    assert_eq!(blocks, vec![10, 12]);
    batch.ack.send(()).unwrap();

    h.wait_live().await;
    assert_eq!(h.checkpoint().await, Some(20));
    assert_eq!(h.rpc.calls().len(), 1, "range was not retried");

    let anomalies = h.sink.anomalies();
    assert_eq!(anomalies.len(), 1);
    match &anomalies[0] {
        Anomaly::DecodeFailure { protocol, chain_id, tx_hash, log_index, reason } => {
            assert_eq!(protocol, "bridge_x");
            assert_eq!(*chain_id, 1);
            assert_eq!(tx_hash, "0xb00");
            assert_eq!(*log_index, 0);
            assert!(reason.contains("data"), "{reason}");
        }
        other => panic!("unexpected anomaly {other:?}"),
    }
    h.stop().await;
}

#[tokio::test]
async fn dropped_normalizer_stops_watcher() {
    let rpc = ScriptedRpc::with_head(10);
    let mut h = spawn(rpc, registry(vec![bridge_x()]), |b| b.start_block(1));

    let batch = h.next_batch().await;
    drop(batch);
    let result = tokio::time::timeout(Duration::from_secs(5), h.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(IndexerError::NormalizerClosed)));
    assert_eq!(*h.state.borrow(), WatcherState::Stopped);
}
