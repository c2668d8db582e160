//! The normalizer task: drains watcher batches, acks them, retries orphans.
//!
//! On start it re-queues the orphans a previous run persisted. On stop it
//! drains the batches already queued, then reports every orphan still
//! waiting as escalated with reason `shutdown`; their persisted records stay
//! for the next run.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crossindex_core::policy::{RetryConfig, RetryPolicy};
use crossindex_core::RawEvent;
use crossindex_evm::EventBatch;

use crate::normalizer::{NormalizeError, Normalizer};

/// Idle wake-up when no orphan is queued.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// Escalation reason for orphans still queued when the service stops.
pub const SHUTDOWN_REASON: &str = "shutdown";

pub struct NormalizerService {
    normalizer: Normalizer,
    batches: mpsc::Receiver<EventBatch>,
    /// Backoff between attempts at an event the normalizer gave up on.
    redelivery: RetryPolicy,
}

impl NormalizerService {
    pub fn new(normalizer: Normalizer, batches: mpsc::Receiver<EventBatch>) -> Self {
        Self {
            normalizer,
            batches,
            redelivery: RetryPolicy::new(RetryConfig {
                max_retries: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
            }),
        }
    }

    /// Process batches until cancelled, then drain whatever is already queued.
    pub async fn run(mut self, cancel: CancellationToken) -> Normalizer {
        tracing::info!("normalizer started");
        if let Err(e) = self.normalizer.restore_orphans().await {
            tracing::warn!(error = %e, "cannot restore persisted orphans, starting without them");
        }
        loop {
            let wake = self
                .normalizer
                .next_orphan_deadline()
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAKE);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = self.batches.recv() => match batch {
                    Some(batch) => {
                        if !self.process(batch, &cancel).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => {
                    if let Err(e) = self.normalizer.retry_due().await {
                        tracing::warn!(error = %e, "orphan retry failed, will try again");
                    }
                }
            }
        }

        self.batches.close();
        let mut drained = 0usize;
        while let Some(batch) = self.batches.recv().await {
            drained += 1;
            if !self.process(batch, &CancellationToken::new()).await {
                break;
            }
        }

        let released = self.normalizer.release_orphans(SHUTDOWN_REASON);
        let stats = self.normalizer.stats();
        tracing::info!(
            drained,
            created = stats.created,
            finalized = stats.finalized,
            orphaned = stats.orphaned,
            rejected = stats.rejected,
            escalated = stats.escalated,
            pending_orphans = released,
            "normalizer stopped"
        );
        self.normalizer
    }

    /// Apply every event of `batch` in order, then ack it. Returns `false`
    /// if cancelled mid-batch; the batch is then left unacked so the watcher
    /// rescans it.
    async fn process(&mut self, batch: EventBatch, cancel: &CancellationToken) -> bool {
        let EventBatch {
            chain_id,
            from_block,
            to_block,
            events,
            ack,
        } = batch;
        let count = events.len();

        for event in events {
            if !self.deliver(event, cancel).await {
                tracing::warn!(chain_id, from_block, to_block, "batch abandoned on shutdown");
                return false;
            }
        }

        tracing::debug!(chain_id, from_block, to_block, events = count, "batch normalized");
        // The watcher may already be gone; its checkpoint then stays put.
        let _ = ack.send(());
        true
    }

    /// Hand one event to the normalizer until it sticks.
    async fn deliver(&mut self, event: RawEvent, cancel: &CancellationToken) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.normalizer.handle(event.clone()).await {
                Ok(_) => return true,
                Err(e) => {
                    attempt += 1;
                    let delay = self.redelivery.delay_for(attempt);
                    log_failure(&event, &e, attempt, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn log_failure(event: &RawEvent, error: &NormalizeError, attempt: u32, delay: Duration) {
    if error.is_transient() {
        tracing::warn!(
            chain_id = event.chain_id,
            tx_hash = %event.tx_hash,
            log_index = event.log_index,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "normalizer failed, redelivering"
        );
    } else {
        tracing::error!(
            chain_id = event.chain_id,
            tx_hash = %event.tx_hash,
            log_index = event.log_index,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "normalizer failed on a non-transient store error, redelivering"
        );
    }
}
