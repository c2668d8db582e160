//! crossindex-core — foundation for the cross-chain message indexer.
//!
//! # Architecture
//!
//! ```text
//! ChainWatcher (per chain) ──RawEvent──► Normalizer ──► MessageStore
//!      │                                     │
//!      ├── DecoderRegistry (Arc<dyn Decoder>) └── orphan retry queue
//!      ├── CheckpointManager (crash recovery)
//!      └── RateLimiter / RetryPolicy
//!
//! Archiver ──► MessageStore::list_finalized_before ──► ObjectStore::put
//! ```
//!
//! This crate holds the chain-agnostic pieces: the unified [`Message`] model,
//! the [`Decoder`] capability contract, the [`DecoderRegistry`], the store
//! traits, and the anomaly reporting contract.

pub mod anomaly;
pub mod chain;
pub mod checkpoint;
pub mod decoder;
pub mod error;
pub mod event;
pub mod message;
pub mod policy;
pub mod registry;
pub mod store;

pub use anomaly::{Anomaly, AnomalySink, RecordingSink};
pub use chain::{ChainConfig, WatcherState};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use decoder::Decoder;
pub use error::{
    DecodeError, IndexerError, ObjectStoreError, RegistryError, StoreError, ValidationError,
};
pub use event::{ChainLog, EventKind, RawEvent};
pub use message::{
    Destination, Message, MessageStatus, MessageType, Metadata, Payload, Source,
};
pub use registry::DecoderRegistry;
pub use store::{MessageStore, ObjectStore, PendingOrphan, VersionedMessage};
