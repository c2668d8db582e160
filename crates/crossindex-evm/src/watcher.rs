//! The per-chain watcher loop.
//!
//! # Tick
//! 1. `safe = head - confirmation_depth`; nothing to do if `safe <= last`.
//! 2. `target = min(safe, last + batch_size)`.
//! 3. For each `max_block_range` chunk of `(last, target]` and each decoder
//!    deployed on this chain: fetch logs, skip removed ones, decode.
//! 4. Send the batch to the normalizer and wait for its ack.
//! 5. Persist `last = target`.
//!
//! Any RPC failure aborts the tick before step 5, so the same range is
//! retried after backoff and never skipped. A single malformed or
//! undecodable log is reported as a `decode_failure` anomaly and skipped.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crossindex_core::policy::RetryPolicy;
use crossindex_core::{
    Anomaly, AnomalySink, ChainConfig, ChainLog, CheckpointManager, Decoder, DecoderRegistry,
    IndexerError, RawEvent, WatcherState,
};
use crossindex_observability::CrossIndexMetrics;

use crate::fetcher::{chunks, EvmFetcher, LogFilter, MalformedLog};

/// Decoded events for one scanned range, handed to the normalizer.
///
/// The watcher only advances its checkpoint once `ack` fires.
#[derive(Debug)]
pub struct EventBatch {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
    /// Ordered by `(block_number, log_index)`.
    pub events: Vec<RawEvent>,
    pub ack: oneshot::Sender<()>,
}

enum Tick {
    /// Nothing new below the safe head.
    UpToDate,
    /// Scanned through `to`; `caught_up` once `to` reached the safe head.
    Advanced { to: u64, caught_up: bool },
}

pub struct ChainWatcher {
    config: ChainConfig,
    fetcher: EvmFetcher,
    registry: DecoderRegistry,
    checkpoint: CheckpointManager,
    sink: Arc<dyn AnomalySink>,
    metrics: CrossIndexMetrics,
    events: mpsc::Sender<EventBatch>,
    state: watch::Sender<WatcherState>,
    /// Range of the tick in flight, for backoff reports.
    attempted: (u64, u64),
}

impl ChainWatcher {
    pub fn new(
        config: ChainConfig,
        fetcher: EvmFetcher,
        registry: DecoderRegistry,
        checkpoint: CheckpointManager,
        sink: Arc<dyn AnomalySink>,
        metrics: CrossIndexMetrics,
        events: mpsc::Sender<EventBatch>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            config,
            fetcher,
            registry,
            checkpoint,
            sink,
            metrics,
            events,
            state,
            attempted: (0, 0),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Observe state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: WatcherState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(chain_id = self.config.chain_id, from = %prev, to = %next, "watcher state");
        }
    }

    /// Run until cancelled or a non-transient error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), IndexerError> {
        let chain_id = self.config.chain_id;
        let backoff = RetryPolicy::new(self.config.backoff.clone());
        let mut attempt = 0u32;

        let mut last = loop {
            let start = tokio::select! {
                _ = cancel.cancelled() => None,
                r = self.starting_block() => Some(r),
            };
            let Some(start) = start else {
                self.set_state(WatcherState::Stopped);
                return Ok(());
            };
            match start {
                Ok(b) => break b,
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if !self.back_off(&backoff, attempt, &e, &cancel).await {
                        self.set_state(WatcherState::Stopped);
                        return if cancel.is_cancelled() { Ok(()) } else { Err(e) };
                    }
                }
                Err(e) => {
                    self.set_state(WatcherState::Stopped);
                    return Err(e);
                }
            }
        };
        attempt = 0;

        tracing::info!(
            chain_id,
            chain = %self.config.name,
            last_scanned = last,
            protocols = ?self.registry.for_chain(chain_id).iter().map(|d| d.protocol().to_string()).collect::<Vec<_>>(),
            "watcher started"
        );
        self.set_state(WatcherState::Syncing);

        loop {
            let tick = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.tick(last) => r,
            };

            match tick {
                Ok(Tick::Advanced { to, caught_up }) => {
                    last = to;
                    attempt = 0;
                    if !caught_up {
                        self.set_state(WatcherState::Syncing);
                        continue;
                    }
                    self.set_state(WatcherState::Live);
                }
                Ok(Tick::UpToDate) => {
                    attempt = 0;
                    self.set_state(WatcherState::Live);
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if !self.back_off(&backoff, attempt, &e, &cancel).await {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.set_state(WatcherState::Stopped);
                        return Err(e);
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(chain_id, error = %e, "watcher stopped");
                    self.set_state(WatcherState::Stopped);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(chain_id, last_scanned = last, "watcher stopped");
        self.set_state(WatcherState::Stopped);
        Ok(())
    }

    /// Last scanned block from the checkpoint, else `start_block - 1`, else
    /// the current safe head.
    async fn starting_block(&self) -> Result<u64, IndexerError> {
        if let Some(b) = self.checkpoint.load().await? {
            return Ok(b);
        }
        let last = match self.config.start_block {
            Some(start) => start.saturating_sub(1),
            None => {
                let head = self.fetcher.head().await?;
                self.config.safe_head(head)
            }
        };
        self.checkpoint.save(last).await?;
        Ok(last)
    }

    /// Sleep out one backoff step. Returns `false` if cancelled or out of
    /// retries.
    async fn back_off(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        error: &IndexerError,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(delay) = policy.next_delay(attempt) else {
            tracing::error!(chain_id = self.config.chain_id, attempt, error = %error, "retries exhausted");
            return false;
        };
        self.set_state(WatcherState::Backoff);
        let (from_block, to_block) = self.attempted;
        tracing::warn!(
            chain_id = self.config.chain_id,
            attempt,
            from_block,
            to_block,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "rpc failure, backing off"
        );
        self.sink.report(Anomaly::WatcherBackoff {
            chain_id: self.config.chain_id,
            from_block,
            to_block,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn tick(&mut self, last: u64) -> Result<Tick, IndexerError> {
        let chain_id = self.config.chain_id;
        self.attempted = (last + 1, last + 1);

        let head = self.fetcher.head().await?;
        let safe = self.config.safe_head(head);
        if safe <= last {
            return Ok(Tick::UpToDate);
        }

        let from = last + 1;
        let target = safe.min(last.saturating_add(self.config.batch_size.max(1)));
        self.attempted = (from, target);

        let events = self.scan(from, target).await?;
        let count = events.len();

        let (ack_tx, ack_rx) = oneshot::channel();
        self.events
            .send(EventBatch {
                chain_id,
                from_block: from,
                to_block: target,
                events,
                ack: ack_tx,
            })
            .await
            .map_err(|_| IndexerError::NormalizerClosed)?;
        ack_rx.await.map_err(|_| IndexerError::NormalizerClosed)?;

        self.checkpoint.save(target).await?;

        tracing::info!(chain_id, from, to = target, safe_head = safe, events = count, "range scanned");
        Ok(Tick::Advanced {
            to: target,
            caught_up: target >= safe,
        })
    }

    /// Fetch and decode `[from, to]` for every decoder deployed on this chain.
    async fn scan(&self, from: u64, to: u64) -> Result<Vec<RawEvent>, IndexerError> {
        let chain_id = self.config.chain_id;
        let decoders = self.registry.for_chain(chain_id);
        if decoders.is_empty() {
            return Ok(vec![]);
        }

        let filters: Vec<LogFilter> = decoders
            .iter()
            .map(|d| LogFilter {
                addresses: d.contract_addresses(chain_id),
                topics: d.event_topics(),
            })
            .collect();

        let mut logs: Vec<(usize, ChainLog)> = Vec::new();
        for (start, end) in chunks(from, to, self.config.max_block_range) {
            for (i, filter) in filters.iter().enumerate() {
                for entry in self.fetcher.logs(start, end, filter).await? {
                    match entry {
                        Ok(log) => logs.push((i, log)),
                        Err(bad) => {
                            report_malformed(decoders[i].as_ref(), &bad, chain_id, self.sink.as_ref())
                        }
                    }
                }
            }
        }
        logs.sort_by_key(|(_, log)| log.position());

        let mut events = Vec::with_capacity(logs.len());
        let mut decoded = vec![0u64; decoders.len()];
        for (i, log) in logs {
            if log.removed {
                continue;
            }
            if let Some(event) = decode_one(decoders[i].as_ref(), &log, chain_id, self.sink.as_ref()) {
                decoded[i] += 1;
                events.push(event);
            }
        }
        for (decoder, count) in decoders.iter().zip(decoded) {
            self.metrics.record_decoded(chain_id, decoder.protocol(), count);
        }
        Ok(events)
    }
}

fn report_malformed(
    decoder: &dyn Decoder,
    bad: &MalformedLog,
    chain_id: u64,
    sink: &dyn AnomalySink,
) {
    tracing::warn!(
        chain_id,
        protocol = decoder.protocol(),
        tx_hash = %bad.tx_hash,
        log_index = bad.log_index,
        error = %bad.error,
        "skipping malformed log"
    );
    sink.report(Anomaly::decode_failure(
        decoder.protocol(),
        chain_id,
        &bad.tx_hash,
        bad.log_index,
        &bad.error,
    ));
}

fn decode_one(
    decoder: &dyn Decoder,
    log: &ChainLog,
    chain_id: u64,
    sink: &dyn AnomalySink,
) -> Option<RawEvent> {
    match decoder.decode(log, chain_id) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                chain_id,
                protocol = decoder.protocol(),
                tx_hash = %log.tx_hash,
                log_index = log.log_index,
                error = %e,
                "skipping undecodable log"
            );
            sink.report(Anomaly::decode_failure(
                decoder.protocol(),
                chain_id,
                &log.tx_hash,
                log.log_index,
                &e,
            ));
            None
        }
    }
}
