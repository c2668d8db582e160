//! Anomaly reporting contract.
//!
//! Anomalies are data or correlation problems that the pipeline skips and
//! keeps going past. They are never fatal, but an operator should see them.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

use crate::error::DecodeError;
use crate::message::Destination;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A log from a registered contract could not be decoded.
    DecodeFailure {
        protocol: String,
        chain_id: u64,
        tx_hash: String,
        log_index: u32,
        reason: String,
    },
    /// A second origination event with a different source for an existing ID.
    DuplicateOrigination {
        message_id: String,
        chain_id: u64,
        tx_hash: String,
    },
    /// A destination leg that disagrees with the one already recorded.
    ConflictingDestination {
        message_id: String,
        existing: Destination,
        incoming: Destination,
    },
    /// An orphan destination leg gave up waiting for its origination.
    OrphanEscalated {
        message_id: String,
        chain_id: u64,
        attempts: u32,
        reason: String,
    },
    /// A chain watcher entered backoff after an RPC failure.
    WatcherBackoff {
        chain_id: u64,
        from_block: u64,
        to_block: u64,
        delay_ms: u64,
        error: String,
    },
    /// Writing a finalized message to object storage failed.
    ArchiveFailure { message_id: String, error: String },
}

impl Anomaly {
    pub fn decode_failure(
        protocol: &str,
        chain_id: u64,
        tx_hash: &str,
        log_index: u32,
        err: &DecodeError,
    ) -> Self {
        Self::DecodeFailure {
            protocol: protocol.to_string(),
            chain_id,
            tx_hash: tx_hash.to_string(),
            log_index,
            reason: err.to_string(),
        }
    }

    /// Short stable name, used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DecodeFailure { .. } => "decode_failure",
            Self::DuplicateOrigination { .. } => "duplicate_origination",
            Self::ConflictingDestination { .. } => "conflicting_destination",
            Self::OrphanEscalated { .. } => "orphan_escalated",
            Self::WatcherBackoff { .. } => "watcher_backoff",
            Self::ArchiveFailure { .. } => "archive_failure",
        }
    }

    /// Chain the anomaly was observed on, when it belongs to one.
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Self::DecodeFailure { chain_id, .. }
            | Self::DuplicateOrigination { chain_id, .. }
            | Self::OrphanEscalated { chain_id, .. }
            | Self::WatcherBackoff { chain_id, .. } => Some(*chain_id),
            Self::ConflictingDestination { .. } | Self::ArchiveFailure { .. } => None,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeFailure { protocol, chain_id, tx_hash, log_index, reason } => write!(
                f,
                "{protocol}: cannot decode log {tx_hash}#{log_index} on chain {chain_id}: {reason}"
            ),
            Self::DuplicateOrigination { message_id, chain_id, tx_hash } => write!(
                f,
                "duplicate origination for {message_id} from {tx_hash} on chain {chain_id}"
            ),
            Self::ConflictingDestination { message_id, existing, incoming } => write!(
                f,
                "conflicting destination for {message_id}: recorded {} on chain {}, got {} on chain {}",
                existing.tx_hash, existing.chain_id, incoming.tx_hash, incoming.chain_id
            ),
            Self::OrphanEscalated { message_id, chain_id, attempts, reason } => write!(
                f,
                "orphan destination for {message_id} on chain {chain_id} escalated after {attempts} attempts: {reason}"
            ),
            Self::WatcherBackoff { chain_id, from_block, to_block, delay_ms, error } => write!(
                f,
                "chain {chain_id} backing off {delay_ms}ms on blocks {from_block}..={to_block}: {error}"
            ),
            Self::ArchiveFailure { message_id, error } => {
                write!(f, "archive of {message_id} failed: {error}")
            }
        }
    }
}

/// Receives anomalies. Must not block; implementations log, count, or buffer.
pub trait AnomalySink: Send + Sync {
    fn report(&self, anomaly: Anomaly);
}

/// Sink that records every anomaly in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Anomaly>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of recorded anomalies of the given [`Anomaly::kind`].
    pub fn count(&self, kind: &str) -> usize {
        self.anomalies().iter().filter(|a| a.kind() == kind).count()
    }
}

impl AnomalySink for RecordingSink {
    fn report(&self, anomaly: Anomaly) {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(anomaly);
    }
}
