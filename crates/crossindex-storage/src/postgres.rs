//! PostgreSQL storage backend for CrossIndex.
//!
//! Persists messages (with their concurrency version and archive flag),
//! pending orphan legs, and watcher checkpoints. Uses `sqlx` with connection pooling.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! crossindex-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! # Schema
//! Created automatically on first connect:
//! - `crossindex_messages` — one row per message ID; the full record as JSONB
//!   plus the columns the archiver filters on
//! - `crossindex_orphans` — destination legs still waiting for their origination
//! - `crossindex_checkpoints` — watcher progress (chain_id + indexer_id → block)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crossindex_core::{
    Checkpoint, CheckpointStore, IndexerError, Message, MessageStore, PendingOrphan, StoreError,
    VersionedMessage,
};

// ─── Connection options ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

fn store_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        other => StoreError::Other(other.to_string()),
    }
}

fn checkpoint_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

// ─── PostgresStorage ─────────────────────────────────────────────────────────

/// PostgreSQL-backed message and checkpoint storage.
///
/// Thread-safe and cheaply cloneable; wraps a connection pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and initialize the schema.
    ///
    /// URL format: `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!("PostgresStorage connected and schema initialized");
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS crossindex_messages (
                message_id      TEXT        PRIMARY KEY,
                protocol        TEXT        NOT NULL,
                status          TEXT        NOT NULL,
                source_chain_id BIGINT      NOT NULL,
                body            JSONB       NOT NULL,
                version         BIGINT      NOT NULL,
                archived        BOOLEAN     NOT NULL DEFAULT FALSE,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_crossindex_messages_archivable
             ON crossindex_messages(updated_at)
             WHERE archived = FALSE AND status <> 'pending'",
            "CREATE INDEX IF NOT EXISTS idx_crossindex_messages_protocol
             ON crossindex_messages(protocol, status)",
            "CREATE TABLE IF NOT EXISTS crossindex_orphans (
                message_id TEXT        PRIMARY KEY,
                body       JSONB       NOT NULL,
                first_seen TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS crossindex_checkpoints (
                chain_id     BIGINT NOT NULL,
                indexer_id   TEXT   NOT NULL,
                block_number BIGINT NOT NULL,
                updated_at   BIGINT NOT NULL,
                PRIMARY KEY (chain_id, indexer_id)
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        debug!("PostgresStorage schema initialized");
        Ok(())
    }

    async fn current_version(&self, message_id: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM crossindex_messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ─── MessageStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for PostgresStorage {
    async fn get(&self, message_id: &str) -> Result<Option<VersionedMessage>, StoreError> {
        let row = sqlx::query(
            "SELECT body, version, archived FROM crossindex_messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| {
            let body: serde_json::Value = r.get("body");
            let message: Message = serde_json::from_value(body)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(VersionedMessage {
                message,
                version: r.get::<i64, _>("version") as u64,
                archived: r.get("archived"),
            })
        })
        .transpose()
    }

    async fn upsert(
        &self,
        message: &Message,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let body = serde_json::to_value(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = match expected_version {
            None => sqlx::query(
                "INSERT INTO crossindex_messages
                    (message_id, protocol, status, source_chain_id, body, version, archived, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, 1, FALSE, $6, $7)
                 ON CONFLICT (message_id) DO NOTHING",
            )
            .bind(&message.message_id)
            .bind(&message.protocol)
            .bind(message.status.as_str())
            .bind(message.source.chain_id as i64)
            .bind(body)
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?,
            Some(v) => sqlx::query(
                "UPDATE crossindex_messages
                 SET status = $2, body = $3, updated_at = $4, version = version + 1, archived = FALSE
                 WHERE message_id = $1 AND version = $5",
            )
            .bind(&message.message_id)
            .bind(message.status.as_str())
            .bind(body)
            .bind(message.updated_at)
            .bind(v as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?,
        };

        if result.rows_affected() == 1 {
            return Ok(expected_version.unwrap_or(0) + 1);
        }
        Err(StoreError::VersionConflict {
            message_id: message.message_id.clone(),
            expected: expected_version,
            actual: self.current_version(&message.message_id).await?,
        })
    }

    async fn list_finalized_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM crossindex_messages
             WHERE archived = FALSE AND status <> 'pending' AND updated_at < $1
             ORDER BY updated_at ASC, message_id ASC
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| {
                serde_json::from_value(r.get::<serde_json::Value, _>("body"))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn mark_archived(&self, message_id: &str) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE crossindex_messages SET archived = TRUE WHERE message_id = $1")
                .bind(message_id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_orphan(&self, orphan: &PendingOrphan) -> Result<(), StoreError> {
        let body = serde_json::to_value(orphan)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO crossindex_orphans (message_id, body, first_seen)
             VALUES ($1, $2, $3)
             ON CONFLICT (message_id)
             DO UPDATE SET body = EXCLUDED.body",
        )
        .bind(&orphan.message_id)
        .bind(body)
        .bind(orphan.first_seen)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_orphan(&self, message_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM crossindex_orphans WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn load_orphans(&self) -> Result<Vec<PendingOrphan>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM crossindex_orphans ORDER BY first_seen ASC, message_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| {
                serde_json::from_value(r.get::<serde_json::Value, _>("body"))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

// ─── CheckpointStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for PostgresStorage {
    async fn load(
        &self,
        chain_id: u64,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_number, updated_at FROM crossindex_checkpoints
             WHERE chain_id = $1 AND indexer_id = $2",
        )
        .bind(chain_id as i64)
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_err)?;

        Ok(row.map(|r| Checkpoint {
            chain_id,
            indexer_id: indexer_id.to_string(),
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get::<i64, _>("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO crossindex_checkpoints (chain_id, indexer_id, block_number, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, indexer_id)
             DO UPDATE SET
                block_number = EXCLUDED.block_number,
                updated_at   = EXCLUDED.updated_at",
        )
        .bind(checkpoint.chain_id as i64)
        .bind(&checkpoint.indexer_id)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(checkpoint_err)?;

        debug!(
            chain_id = checkpoint.chain_id,
            indexer_id = %checkpoint.indexer_id,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, chain_id: u64, indexer_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM crossindex_checkpoints WHERE chain_id = $1 AND indexer_id = $2")
            .bind(chain_id as i64)
            .bind(indexer_id)
            .execute(&self.pool)
            .await
            .map_err(checkpoint_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a running PostgreSQL instance.
    // Example: DATABASE_URL=postgresql://localhost/crossindex_test cargo test --features postgres

    use super::*;
    use crossindex_core::{MessageStatus, MessageType, Source};

    async fn connect() -> PostgresStorage {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        PostgresStorage::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_checkpoint_roundtrip() {
        let store = connect().await;
        let cp = Checkpoint {
            chain_id: 1,
            indexer_id: "test-indexer".into(),
            block_number: 19_000_000,
            updated_at: 0,
        };
        store.save(cp).await.unwrap();

        let loaded = store.load(1, "test-indexer").await.unwrap().expect("checkpoint not found");
        assert_eq!(loaded.block_number, 19_000_000);

        store.delete(1, "test-indexer").await.unwrap();
        assert!(store.load(1, "test-indexer").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_conditional_upsert() {
        let store = connect().await;
        let now = Utc::now();
        let id = format!("test-{}", now.timestamp_nanos_opt().unwrap_or_default());
        let mut m = Message {
            message_id: id.clone(),
            protocol: "bridge_x".into(),
            message_type: MessageType::Message,
            status: MessageStatus::Pending,
            source: Source {
                chain_id: 1,
                tx_hash: "0x01".into(),
                block_number: 1,
                timestamp: 0,
                sender: "0xaa".into(),
                log_index: 0,
            },
            destination: None,
            payload: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(store.upsert(&m, None).await.unwrap(), 1);
        assert!(store.upsert(&m, None).await.unwrap_err().is_conflict());

        m.status = MessageStatus::Failed;
        assert_eq!(store.upsert(&m, Some(1)).await.unwrap(), 2);
        assert!(store.upsert(&m, Some(1)).await.unwrap_err().is_conflict());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.message.status, MessageStatus::Failed);

        store.mark_archived(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_orphan_roundtrip() {
        let store = connect().await;
        let now = Utc::now();
        let id = format!("orphan-{}", now.timestamp_nanos_opt().unwrap_or_default());
        let mut orphan = PendingOrphan {
            message_id: id.clone(),
            events: vec![],
            attempts: 0,
            first_seen: now,
        };
        store.save_orphan(&orphan).await.unwrap();
        orphan.attempts = 2;
        store.save_orphan(&orphan).await.unwrap();

        let loaded = store.load_orphans().await.unwrap();
        let found = loaded.iter().find(|o| o.message_id == id).expect("orphan not found");
        assert_eq!(found.attempts, 2);

        store.delete_orphan(&id).await.unwrap();
        store.delete_orphan(&id).await.unwrap();
        assert!(!store.load_orphans().await.unwrap().iter().any(|o| o.message_id == id));
    }
}
