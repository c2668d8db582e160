//! Checkpoint manager: persists each chain watcher's scan position.
//!
//! A checkpoint stores the last block whose events were fully handed to the
//! normalizer. On restart the watcher resumes right after it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::IndexerError;

/// A persisted scan position for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: u64,
    /// Watcher identity; lets several deployments share one store.
    pub indexer_id: String,
    /// Last fully processed block (`lastScannedBlock`).
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implementations: [`MemoryCheckpointStore`] here, and a PostgreSQL store in
/// `crossindex-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        chain_id: u64,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. to force a rescan from `start_block`).
    async fn delete(&self, chain_id: u64, indexer_id: &str) -> Result<(), IndexerError>;
}

/// Checkpoint reads/writes for one watcher.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: u64,
    indexer_id: String,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        chain_id: u64,
        indexer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            chain_id,
            indexer_id: indexer_id.into(),
        }
    }

    /// Last scanned block, or `None` on first run.
    pub async fn load(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .store
            .load(self.chain_id, &self.indexer_id)
            .await?
            .map(|cp| cp.block_number))
    }

    pub async fn save(&self, block_number: u64) -> Result<(), IndexerError> {
        let cp = Checkpoint {
            chain_id: self.chain_id,
            indexer_id: self.indexer_id.clone(),
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await
    }

    pub async fn reset(&self) -> Result<(), IndexerError> {
        self.store.delete(self.chain_id, &self.indexer_id).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<(u64, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u64, String), Checkpoint>> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        chain_id: u64,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.lock().get(&(chain_id, indexer_id.to_string())).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = (checkpoint.chain_id, checkpoint.indexer_id.clone());
        self.lock().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: u64, indexer_id: &str) -> Result<(), IndexerError> {
        self.lock().remove(&(chain_id, indexer_id.to_string()));
        Ok(())
    }
}
