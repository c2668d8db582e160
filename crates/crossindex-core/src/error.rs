//! Error types shared across the crossindex pipeline.

use thiserror::Error;

use crate::message::MessageStatus;

/// Errors a [`Decoder`](crate::decoder::Decoder) returns for a single log.
///
/// Decoders are pure, so the same log always yields the same error; the
/// type is comparable to make that checkable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unrecognized log from {address} (topic0 {topic0})")]
    UnrecognizedLog { address: String, topic0: String },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// The node returned a log whose own fields cannot be parsed.
    #[error("Malformed log field '{field}': {reason}")]
    MalformedLog { field: &'static str, reason: String },
}

/// Errors from the decoder registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Decoder already registered for protocol '{protocol}'")]
    DuplicateProtocol { protocol: String },
}

/// Errors from a [`MessageStore`](crate::store::MessageStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached; the caller should back off and retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A conditional write lost against a concurrent writer.
    #[error("Version conflict on message '{message_id}': expected {expected:?}, found {actual:?}")]
    VersionConflict {
        message_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Message '{message_id}' not found")]
    NotFound { message_id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Structural problems found by [`Message::validate`](crate::message::Message::validate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("updated_at precedes created_at")]
    UpdatedBeforeCreated,

    #[error("{status} message has no destination")]
    MissingDestination { status: MessageStatus },

    #[error("Pending message has a destination")]
    UnexpectedDestination,
}

/// Errors from an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object storage unavailable: {0}")]
    Unavailable(String),

    #[error("Object '{key}' rejected: {reason}")]
    Rejected { key: String, reason: String },
}

/// Errors that can occur while a chain watcher is indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC provider throttled the request: {0}")]
    Throttled(String),

    #[error("RPC request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Normalizer is no longer accepting events")]
    NormalizerClosed,

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for failures the watcher retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::Throttled(_) | Self::Timeout { .. } | Self::Storage(_)
        )
    }
}

impl From<StoreError> for IndexerError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}
