//! In-memory storage backend.
//!
//! Stores messages, pending orphans, and archived objects in RAM. Useful for testing and
//! short-lived runs that don't need persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crossindex_core::{
    Message, MessageStore, ObjectStore, ObjectStoreError, PendingOrphan, StoreError,
    VersionedMessage,
};

/// In-memory [`MessageStore`] with per-key optimistic concurrency.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<HashMap<String, VersionedMessage>>,
    orphans: Mutex<HashMap<String, PendingOrphan>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VersionedMessage>> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Total number of stored messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_orphans(&self) -> MutexGuard<'_, HashMap<String, PendingOrphan>> {
        self.orphans.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of persisted orphans.
    pub fn orphan_count(&self) -> usize {
        self.lock_orphans().len()
    }

    /// Snapshot of every stored message, ordered by ID.
    pub fn all(&self) -> Vec<VersionedMessage> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.message.message_id.cmp(&b.message.message_id));
        all
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn get(&self, message_id: &str) -> Result<Option<VersionedMessage>, StoreError> {
        Ok(self.lock().get(message_id).cloned())
    }

    async fn upsert(
        &self,
        message: &Message,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut map = self.lock();
        let current = map.get(&message.message_id).map(|m| m.version);
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                message_id: message.message_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }
        let version = current.unwrap_or(0) + 1;
        map.insert(
            message.message_id.clone(),
            VersionedMessage {
                message: message.clone(),
                version,
                archived: false,
            },
        );
        Ok(version)
    }

    async fn list_finalized_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut due: Vec<Message> = self
            .lock()
            .values()
            .filter(|m| {
                !m.archived && m.message.status.is_terminal() && m.message.updated_at < cutoff
            })
            .map(|m| m.message.clone())
            .collect();
        due.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_archived(&self, message_id: &str) -> Result<(), StoreError> {
        match self.lock().get_mut(message_id) {
            Some(m) => {
                m.archived = true;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                message_id: message_id.to_string(),
            }),
        }
    }

    async fn save_orphan(&self, orphan: &PendingOrphan) -> Result<(), StoreError> {
        self.lock_orphans()
            .insert(orphan.message_id.clone(), orphan.clone());
        Ok(())
    }

    async fn delete_orphan(&self, message_id: &str) -> Result<(), StoreError> {
        self.lock_orphans().remove(message_id);
        Ok(())
    }

    async fn load_orphans(&self) -> Result<Vec<PendingOrphan>, StoreError> {
        let mut all: Vec<PendingOrphan> = self.lock_orphans().values().cloned().collect();
        all.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(all)
    }
}

// ─── Object store ─────────────────────────────────────────────────────────────

/// In-memory [`ObjectStore`]; keeps every object keyed by its path.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.lock().insert(key.to_string(), body);
        Ok(())
    }
}
