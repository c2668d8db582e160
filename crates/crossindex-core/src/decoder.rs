//! The `Decoder` capability contract.
//!
//! Every protocol decoder implements `Decoder`. The trait is object-safe so
//! decoders can be stored as `Arc<dyn Decoder>` in the registry and shared by
//! all chain watchers.

use crate::error::DecodeError;
use crate::event::{ChainLog, RawEvent};

/// Turns one protocol's raw chain logs into [`RawEvent`]s.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; a single instance is shared across
/// every watcher task.
///
/// # Purity
/// `decode` must be a pure function of its inputs: decoding the same log
/// twice yields value-identical events (or the same error).
pub trait Decoder: Send + Sync {
    /// Protocol name. Registry key and `protocol` field of every output.
    fn protocol(&self) -> &str;

    /// Contract addresses this protocol emits from on `chain_id`.
    /// Empty when the protocol is not deployed there.
    fn contract_addresses(&self, chain_id: u64) -> Vec<String>;

    /// Event signature hashes (`topic0`) used to pre-filter log queries.
    fn event_topics(&self) -> Vec<String>;

    /// Decode one log observed on `chain_id`.
    fn decode(&self, log: &ChainLog, chain_id: u64) -> Result<RawEvent, DecodeError>;

    /// Returns `true` if the protocol has at least one contract on `chain_id`.
    fn is_deployed_on(&self, chain_id: u64) -> bool {
        !self.contract_addresses(chain_id).is_empty()
    }
}
