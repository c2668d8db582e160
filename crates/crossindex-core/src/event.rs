//! Chain logs (decoder input) and raw protocol events (decoder output).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known payload keys shared between decoders and the normalizer.
pub mod keys {
    pub const MESSAGE_ID: &str = "message_id";
    pub const MESSAGE_TYPE: &str = "message_type";
    pub const SENDER: &str = "sender";
    pub const RECEIVER: &str = "receiver";
    pub const TOKEN: &str = "token";
    pub const AMOUNT: &str = "amount";
    pub const DATA: &str = "data";
    pub const NONCE: &str = "nonce";
    pub const FEE: &str = "fee";
    pub const RELAYER: &str = "relayer";
    pub const GAS_USED: &str = "gas_used";
    pub const SUCCESS: &str = "success";
}

/// Event type tags the normalizer understands. Other tags are ignored.
pub mod tags {
    pub const SENT: &str = "sent";
    pub const EXECUTED: &str = "executed";
    pub const FAILED: &str = "failed";
}

// ─── ChainLog ─────────────────────────────────────────────────────────────────

/// A log emitted by a contract, as handed to a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    /// Emitting contract address (`0x…`).
    pub address: String,
    /// `topics[0]` is the event signature hash; the rest are indexed params.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed parameters.
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u32,
    /// Unix timestamp (seconds) of the containing block.
    pub block_timestamp: i64,
    /// Set by the node when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl ChainLog {
    /// The event signature hash, if present.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(|s| s.as_str())
    }

    /// Ordering key within one chain: block first, then log index.
    pub fn position(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }
}

// ─── RawEvent ─────────────────────────────────────────────────────────────────

/// Protocol-specific decode output, before cross-chain normalization.
///
/// `(chain_id, tx_hash, log_index)` identifies a RawEvent uniquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub protocol: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u32,
    /// Block timestamp (Unix seconds).
    pub timestamp: i64,
    /// Event type tag, e.g. [`tags::SENT`].
    pub event_type: String,
    /// Protocol-defined payload, string-encoded and ordered by key.
    pub data: BTreeMap<String, String>,
}

/// Lifecycle role of a [`RawEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The origination (send) leg.
    Origination,
    /// The destination (execution) leg and its outcome.
    Execution { success: bool },
    /// Protocol-internal event the normalizer does not act on.
    Other,
}

impl RawEvent {
    /// Look up a payload field, treating empty strings as absent.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Unique identity of the log this event was decoded from.
    pub fn log_key(&self) -> (u64, String, u32) {
        (self.chain_id, self.tx_hash.to_ascii_lowercase(), self.log_index)
    }

    /// Classify the event from its type tag and `success` payload field.
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            tags::SENT => EventKind::Origination,
            tags::FAILED => EventKind::Execution { success: false },
            tags::EXECUTED => {
                let success = !matches!(
                    self.field(keys::SUCCESS).map(|s| s.to_ascii_lowercase()),
                    Some(ref s) if s == "false" || s == "0"
                );
                EventKind::Execution { success }
            }
            _ => EventKind::Other,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, data: &[(&str, &str)]) -> RawEvent {
        RawEvent {
            protocol: "bridge_x".into(),
            chain_id: 1,
            block_number: 100,
            tx_hash: "0xABC".into(),
            log_index: 3,
            timestamp: 1_700_000_000,
            event_type: event_type.into(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn kind_from_tags() {
        assert_eq!(event("sent", &[]).kind(), EventKind::Origination);
        assert_eq!(
            event("executed", &[]).kind(),
            EventKind::Execution { success: true }
        );
        assert_eq!(
            event("failed", &[]).kind(),
            EventKind::Execution { success: false }
        );
        assert_eq!(event("fee_paid", &[]).kind(), EventKind::Other);
    }

    #[test]
    fn executed_with_false_success_is_failure() {
        assert_eq!(
            event("executed", &[("success", "false")]).kind(),
            EventKind::Execution { success: false }
        );
        assert_eq!(
            event("executed", &[("success", "0")]).kind(),
            EventKind::Execution { success: false }
        );
        assert_eq!(
            event("executed", &[("success", "true")]).kind(),
            EventKind::Execution { success: true }
        );
    }

    #[test]
    fn empty_fields_are_absent() {
        let e = event("sent", &[("token", ""), ("amount", "10")]);
        assert_eq!(e.field("token"), None);
        assert_eq!(e.field("amount"), Some("10"));
    }

    #[test]
    fn log_key_is_case_insensitive_on_hash() {
        let e = event("sent", &[]);
        assert_eq!(e.log_key(), (1, "0xabc".to_string(), 3));
    }
}
