//! Storage contracts: the durable message store and the archive object store.
//!
//! Implementations live in `crossindex-storage` (in-memory, PostgreSQL, S3).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ObjectStoreError, StoreError};
use crate::event::RawEvent;
use crate::message::Message;

/// A stored message together with its concurrency-control version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedMessage {
    pub message: Message,
    /// Incremented on every successful write. Starts at 1.
    pub version: u64,
    /// Set once the record has been written to object storage.
    pub archived: bool,
}

/// Destination legs persisted while they wait for their origination, so a
/// restart resumes the retry instead of losing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrphan {
    pub message_id: String,
    /// Distinct destination legs, in arrival order.
    pub events: Vec<RawEvent>,
    /// Retries performed so far.
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
}

/// Durable keyed storage for [`Message`] records and the orphan legs that
/// are still waiting to become one.
///
/// Every message mutation is a conditional write on the version the caller
/// read, so two writers racing on one message ID cannot both win.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get(&self, message_id: &str) -> Result<Option<VersionedMessage>, StoreError>;

    /// Insert or update `message`.
    ///
    /// `expected_version = None` inserts only if no record exists;
    /// `Some(v)` updates only if the stored version is still `v`.
    /// Returns the new version, or [`StoreError::VersionConflict`].
    async fn upsert(
        &self,
        message: &Message,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Terminal, not-yet-archived messages last updated before `cutoff`,
    /// oldest first, at most `limit`.
    async fn list_finalized_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Flag a message as archived. Idempotent.
    async fn mark_archived(&self, message_id: &str) -> Result<(), StoreError>;

    /// Insert or replace the pending orphan for `orphan.message_id`.
    async fn save_orphan(&self, orphan: &PendingOrphan) -> Result<(), StoreError>;

    /// Forget a resolved or escalated orphan. Idempotent.
    async fn delete_orphan(&self, message_id: &str) -> Result<(), StoreError>;

    /// Every persisted orphan, oldest first.
    async fn load_orphans(&self) -> Result<Vec<PendingOrphan>, StoreError>;
}

/// Write-only blob storage used by the archiver.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, overwriting any existing object.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;
}
