//! Correlates origination and destination legs into [`Message`] records.
//!
//! The normalizer is the only writer of message state. Every write is a
//! read-modify-write against the store, conditional on the version that was
//! read, so replays and concurrent writers cannot move a message backwards.
//!
//! | event | stored message | result |
//! |---|---|---|
//! | origination | none | create `pending` |
//! | origination | same source | no-op |
//! | origination | other source | `DuplicateOrigination` |
//! | destination | `pending` | `executed` / `failed` |
//! | destination | none | held in the orphan queue |
//! | destination | terminal, same destination | no-op |
//! | destination | terminal, other destination | `ConflictingDestination` |
//!
//! Orphans are mirrored into the store as they are queued, retried, and
//! resolved, so a restart picks them up again with [`Normalizer::restore_orphans`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use crossindex_core::message::{message_id_of, TransitionRejected};
use crossindex_core::policy::{RetryConfig, RetryPolicy};
use crossindex_core::{
    Anomaly, AnomalySink, Destination, EventKind, Message, MessageStatus, MessageStore, RawEvent,
    Source, StoreError,
};
use crossindex_observability::CrossIndexMetrics;

use crate::orphans::{Orphan, OrphanPolicy, OrphanQueue, Reschedule};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Store error on message '{message_id}': {source}")]
    Store {
        message_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Message '{message_id}' kept changing underneath; gave up after {attempts} attempts")]
    ContentionExhausted { message_id: String, attempts: u32 },

    #[error("Cannot load persisted orphans: {0}")]
    OrphanLoad(#[source] StoreError),
}

impl NormalizeError {
    /// Returns `true` if handling the same event again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store { source, .. } | Self::OrphanLoad(source) => source.is_transient(),
            Self::ContentionExhausted { .. } => true,
        }
    }
}

/// What [`Normalizer::handle`] did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new `pending` message was stored.
    Created,
    /// A pending message reached `executed` or `failed`.
    Finalized(MessageStatus),
    /// The event was already applied.
    Unchanged,
    /// No origination yet; the event waits in the orphan queue.
    Orphaned,
    /// Rejected as contradicting stored state; reported to the anomaly sink.
    Rejected(&'static str),
    /// Not a lifecycle event.
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    /// Re-read/re-apply rounds after losing a conditional write.
    pub max_conflict_retries: u32,
    /// Backoff for an unavailable store.
    pub store_retry: RetryConfig,
    pub orphans: OrphanPolicy,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            store_retry: RetryConfig {
                max_retries: 5,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                multiplier: 2.0,
            },
            orphans: OrphanPolicy::default(),
        }
    }
}

/// Running totals for the shutdown summary. Live counts go to
/// [`CrossIndexMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub created: u64,
    pub finalized: u64,
    pub unchanged: u64,
    pub orphaned: u64,
    pub rejected: u64,
    pub escalated: u64,
    pub ignored: u64,
}

pub struct Normalizer {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn AnomalySink>,
    metrics: CrossIndexMetrics,
    orphans: OrphanQueue,
    store_retry: RetryPolicy,
    max_conflict_retries: u32,
    stats: NormalizerStats,
}

impl Normalizer {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn AnomalySink>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            store,
            sink,
            metrics: CrossIndexMetrics::global(),
            orphans: OrphanQueue::new(config.orphans),
            store_retry: RetryPolicy::new(config.store_retry),
            max_conflict_retries: config.max_conflict_retries,
            stats: NormalizerStats::default(),
        }
    }

    /// Record through `metrics` instead of the global meter provider.
    pub fn with_metrics(mut self, metrics: CrossIndexMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn stats(&self) -> &NormalizerStats {
        &self.stats
    }

    pub fn orphans(&self) -> &OrphanQueue {
        &self.orphans
    }

    /// Apply one decoded event.
    pub async fn handle(&mut self, event: RawEvent) -> Result<Outcome, NormalizeError> {
        let message_id = message_id_of(&event);
        let outcome = self.apply(&message_id, &event).await?;
        self.count(&outcome, &event);

        match outcome {
            Outcome::Orphaned => {
                tracing::debug!(
                    message_id = %message_id,
                    chain_id = event.chain_id,
                    tx_hash = %event.tx_hash,
                    "destination before origination, holding"
                );
                let evicted = self.orphans.push(message_id.clone(), event, Instant::now());
                if let Some(evicted) = evicted {
                    self.escalate(evicted, "orphan queue full").await;
                }
                // The caller redelivers on failure; the queue dedups the leg.
                self.persist_orphan(&message_id).await?;
            }
            Outcome::Created => {
                if let Some(orphan) = self.orphans.remove(&message_id) {
                    if let Err(e) = self.replay(&message_id, &orphan.events).await {
                        self.orphans.restore(orphan);
                        return Err(e);
                    }
                    self.forget_orphan(&message_id).await;
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Re-queue the orphans a previous run persisted. Returns how many were
    /// adopted.
    pub async fn restore_orphans(&mut self) -> Result<usize, NormalizeError> {
        let pending = self
            .store
            .load_orphans()
            .await
            .map_err(NormalizeError::OrphanLoad)?;
        let count = pending.len();
        let (now, wall_now) = (Instant::now(), Utc::now());
        for p in pending {
            if let Some(evicted) = self.orphans.adopt(p, now, wall_now) {
                self.escalate(evicted, "orphan queue full").await;
            }
        }
        if count > 0 {
            tracing::info!(orphans = count, "restored pending orphans");
        }
        Ok(count)
    }

    /// Report every queued orphan as escalated with `reason` and empty the
    /// queue. Persisted records are kept so the next run resumes them.
    pub fn release_orphans(&mut self, reason: &str) -> usize {
        let orphans = self.orphans.drain();
        let count = orphans.len();
        for orphan in orphans {
            self.report_escalation(orphan, reason);
        }
        count
    }

    /// Retry every orphan whose backoff has elapsed. Returns how many
    /// messages were resolved.
    pub async fn retry_due(&mut self) -> Result<usize, NormalizeError> {
        let mut due = self.orphans.take_due(Instant::now()).into_iter();
        let mut resolved = 0;
        while let Some(orphan) = due.next() {
            let outcome = match self.apply(&orphan.message_id, &orphan.events[0]).await {
                Ok(o) => o,
                Err(e) => {
                    // Keep this and the untried entries queued.
                    self.orphans.restore(orphan);
                    due.for_each(|o| self.orphans.restore(o));
                    return Err(e);
                }
            };
            if outcome == Outcome::Orphaned {
                let message_id = orphan.message_id.clone();
                match self.orphans.reschedule(orphan, Instant::now()) {
                    Reschedule::Queued => self.save_attempts(&message_id).await,
                    Reschedule::Exhausted(o, reason) => self.escalate(o, reason).await,
                }
                continue;
            }
            self.count(&outcome, &orphan.events[0]);
            resolved += 1;
            if let Err(e) = self.replay(&orphan.message_id, &orphan.events[1..]).await {
                // Replaying the applied leg again is a no-op.
                self.orphans.restore(orphan);
                due.for_each(|o| self.orphans.restore(o));
                return Err(e);
            }
            self.forget_orphan(&orphan.message_id).await;
        }
        Ok(resolved)
    }

    /// Earliest time an orphan is due for retry.
    pub fn next_orphan_deadline(&self) -> Option<Instant> {
        self.orphans.next_deadline()
    }

    async fn replay(&mut self, message_id: &str, events: &[RawEvent]) -> Result<(), NormalizeError> {
        for event in events {
            let outcome = self.apply(message_id, event).await?;
            tracing::debug!(message_id, outcome = ?outcome, "orphan replayed");
            self.count(&outcome, event);
        }
        Ok(())
    }

    async fn persist_orphan(&self, message_id: &str) -> Result<(), NormalizeError> {
        let Some(orphan) = self.orphans.get(message_id) else {
            return Ok(());
        };
        self.store
            .save_orphan(&orphan.to_pending())
            .await
            .map_err(|source| NormalizeError::Store {
                message_id: message_id.to_string(),
                source,
            })
    }

    /// Best effort: a stale record only causes one extra retry after restart.
    async fn save_attempts(&self, message_id: &str) {
        if let Err(e) = self.persist_orphan(message_id).await {
            tracing::warn!(message_id, error = %e, "cannot persist orphan retry state");
        }
    }

    /// Best effort: a leftover record is resolved as a replay after restart.
    async fn forget_orphan(&self, message_id: &str) {
        if let Err(e) = self.store.delete_orphan(message_id).await {
            tracing::warn!(message_id, error = %e, "cannot delete persisted orphan");
        }
    }

    async fn escalate(&mut self, orphan: Orphan, reason: &str) {
        let message_id = orphan.message_id.clone();
        self.report_escalation(orphan, reason);
        self.forget_orphan(&message_id).await;
    }

    fn report_escalation(&mut self, orphan: Orphan, reason: &str) {
        self.stats.escalated += 1;
        self.metrics.record_orphan_escalated(orphan.chain_id(), reason);
        tracing::warn!(
            message_id = %orphan.message_id,
            chain_id = orphan.chain_id(),
            attempts = orphan.attempts,
            reason,
            "orphan destination escalated"
        );
        self.sink.report(Anomaly::OrphanEscalated {
            chain_id: orphan.chain_id(),
            message_id: orphan.message_id,
            attempts: orphan.attempts,
            reason: reason.to_string(),
        });
    }

    fn count(&mut self, outcome: &Outcome, event: &RawEvent) {
        let s = &mut self.stats;
        match outcome {
            Outcome::Created => {
                s.created += 1;
                self.metrics.record_created(&event.protocol, event.chain_id);
            }
            Outcome::Finalized(status) => {
                s.finalized += 1;
                self.metrics.record_finalized(&event.protocol, *status);
            }
            Outcome::Unchanged => s.unchanged += 1,
            Outcome::Orphaned => s.orphaned += 1,
            Outcome::Rejected(_) => s.rejected += 1,
            Outcome::Ignored => s.ignored += 1,
        }
    }

    /// Apply with store retries and the conflict re-read loop.
    async fn apply(&self, message_id: &str, event: &RawEvent) -> Result<Outcome, NormalizeError> {
        let mut conflicts = 0u32;
        let mut failures = 0u32;
        loop {
            match self.try_apply(message_id, event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.max_conflict_retries {
                        return Err(NormalizeError::ContentionExhausted {
                            message_id: message_id.to_string(),
                            attempts: conflicts,
                        });
                    }
                    tracing::debug!(message_id, conflicts, "version conflict, re-reading");
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let Some(delay) = self.store_retry.next_delay(failures) else {
                        return Err(NormalizeError::Store {
                            message_id: message_id.to_string(),
                            source: e,
                        });
                    };
                    tracing::warn!(
                        message_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(NormalizeError::Store {
                        message_id: message_id.to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    async fn try_apply(&self, message_id: &str, event: &RawEvent) -> Result<Outcome, StoreError> {
        let current = self.store.get(message_id).await?;
        match event.kind() {
            EventKind::Origination => match current {
                None => {
                    let message = Message::new_pending(message_id.to_string(), event, Utc::now());
                    self.store.upsert(&message, None).await?;
                    tracing::debug!(
                        message_id,
                        protocol = %event.protocol,
                        chain_id = event.chain_id,
                        "message created"
                    );
                    Ok(Outcome::Created)
                }
                Some(stored) if stored.message.source == Source::from_event(event) => {
                    Ok(Outcome::Unchanged)
                }
                Some(_) => {
                    tracing::warn!(
                        message_id,
                        chain_id = event.chain_id,
                        tx_hash = %event.tx_hash,
                        "duplicate origination rejected"
                    );
                    self.sink.report(Anomaly::DuplicateOrigination {
                        message_id: message_id.to_string(),
                        chain_id: event.chain_id,
                        tx_hash: event.tx_hash.clone(),
                    });
                    Ok(Outcome::Rejected("duplicate_origination"))
                }
            },
            EventKind::Execution { success } => {
                let Some(stored) = current else {
                    return Ok(Outcome::Orphaned);
                };
                let mut message = stored.message;
                match message.execute(event, success, Utc::now()) {
                    Ok(()) => {
                        self.store.upsert(&message, Some(stored.version)).await?;
                        tracing::debug!(
                            message_id,
                            status = %message.status,
                            chain_id = event.chain_id,
                            "message finalized"
                        );
                        Ok(Outcome::Finalized(message.status))
                    }
                    Err(TransitionRejected::Replay) => Ok(Outcome::Unchanged),
                    Err(TransitionRejected::Conflict { existing }) => {
                        tracing::warn!(
                            message_id,
                            chain_id = event.chain_id,
                            tx_hash = %event.tx_hash,
                            "conflicting destination rejected"
                        );
                        self.sink.report(Anomaly::ConflictingDestination {
                            message_id: message_id.to_string(),
                            existing,
                            incoming: Destination::from_event(event),
                        });
                        Ok(Outcome::Rejected("conflicting_destination"))
                    }
                }
            }
            EventKind::Other => Ok(Outcome::Ignored),
        }
    }
}
