//! Periodic export of finalized messages to object storage.
//!
//! Each message lands at a content-addressed key, so archiving it twice
//! overwrites the same object. A message is marked archived only after its
//! object was written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crossindex_core::{
    Anomaly, AnomalySink, Message, MessageStore, ObjectStore, ObjectStoreError, StoreError,
};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Listing finalized messages failed: {0}")]
    List(#[source] StoreError),

    #[error("Cannot serialize message '{message_id}': {source}")]
    Serialize {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Writing {key} failed: {source}")]
    Put {
        key: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("Marking '{message_id}' archived failed: {source}")]
    Mark {
        message_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiverConfig {
    pub interval: Duration,
    /// Minimum age of a finalized message (since its last update).
    pub retention: Duration,
    /// Messages exported per pass.
    pub batch_size: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
            batch_size: 500,
        }
    }
}

/// Counts from one archive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: usize,
    pub failed: usize,
}

/// `messages/{protocol}/{sha256("{protocol}:{message_id}") hex}.json`
pub fn archive_key(protocol: &str, message_id: &str) -> String {
    let digest = Sha256::digest(format!("{protocol}:{message_id}").as_bytes());
    format!("messages/{protocol}/{}.json", hex::encode(digest))
}

pub struct Archiver {
    store: Arc<dyn MessageStore>,
    objects: Arc<dyn ObjectStore>,
    sink: Arc<dyn AnomalySink>,
    config: ArchiverConfig,
}

impl Archiver {
    pub fn new(
        store: Arc<dyn MessageStore>,
        objects: Arc<dyn ObjectStore>,
        sink: Arc<dyn AnomalySink>,
        config: ArchiverConfig,
    ) -> Self {
        Self {
            store,
            objects,
            sink,
            config,
        }
    }

    /// Run a pass every `interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "archiver started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Keep going while passes come back full.
            loop {
                match self.run_once(Utc::now(), &cancel).await {
                    Ok(report) if report.archived + report.failed >= self.config.batch_size
                        && report.archived > 0
                        && !cancel.is_cancelled() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "archive pass failed");
                        break;
                    }
                }
            }
        }
        tracing::info!("archiver stopped");
    }

    /// Export up to `batch_size` messages finalized before `now - retention`.
    ///
    /// Stops between records once `cancel` fires.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ArchiveReport, ArchiveError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let due = self
            .store
            .list_finalized_before(cutoff, self.config.batch_size)
            .await
            .map_err(ArchiveError::List)?;

        let mut report = ArchiveReport::default();
        for message in &due {
            if cancel.is_cancelled() {
                break;
            }
            match self.archive(message).await {
                Ok(()) => report.archived += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(message_id = %message.message_id, error = %error, "archive failed");
                    self.sink.report(Anomaly::ArchiveFailure {
                        message_id: message.message_id.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        if !due.is_empty() {
            tracing::info!(archived = report.archived, failed = report.failed, %cutoff, "archive pass");
        }
        Ok(report)
    }

    async fn archive(&self, message: &Message) -> Result<(), ArchiveError> {
        let key = archive_key(&message.protocol, &message.message_id);
        let body = serde_json::to_vec_pretty(message).map_err(|source| ArchiveError::Serialize {
            message_id: message.message_id.clone(),
            source,
        })?;
        if let Err(source) = self.objects.put(&key, body).await {
            return Err(ArchiveError::Put { key, source });
        }
        self.store
            .mark_archived(&message.message_id)
            .await
            .map_err(|source| ArchiveError::Mark {
                message_id: message.message_id.clone(),
                source,
            })?;
        tracing::debug!(message_id = %message.message_id, key = %key, "message archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crossindex_core::{MessageStatus, MessageType, RecordingSink, Source, VersionedMessage};
    use crossindex_storage::{InMemoryMessageStore, InMemoryObjectStore};
    use pretty_assertions::assert_eq;

    fn finalized(id: &str, updated_at: DateTime<Utc>) -> Message {
        Message {
            message_id: id.into(),
            protocol: "bridge_x".into(),
            message_type: MessageType::Message,
            status: MessageStatus::Executed,
            source: Source {
                chain_id: 1,
                tx_hash: "0x01".into(),
                block_number: 100,
                timestamp: 0,
                sender: "0xaa".into(),
                log_index: 0,
            },
            destination: None,
            payload: None,
            metadata: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn config() -> ArchiverConfig {
        ArchiverConfig {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
            batch_size: 10,
        }
    }

    #[test]
    fn key_is_content_addressed() {
        let a = archive_key("bridge_x", "m1");
        assert_eq!(a, archive_key("bridge_x", "m1"));
        assert_ne!(a, archive_key("bridge_y", "m1"));
        assert!(a.starts_with("messages/bridge_x/"));
        assert!(a.ends_with(".json"));
        // 64 hex chars between the prefix and the extension.
        assert_eq!(a.len(), "messages/bridge_x/".len() + 64 + ".json".len());
    }

    #[tokio::test]
    async fn archives_only_messages_past_retention() {
        let store = Arc::new(InMemoryMessageStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let now = Utc::now();
        store
            .upsert(&finalized("old", now - chrono::Duration::hours(2)), None)
            .await
            .unwrap();
        store
            .upsert(&finalized("fresh", now - chrono::Duration::minutes(5)), None)
            .await
            .unwrap();

        let archiver = Archiver::new(
            store.clone(),
            objects.clone(),
            Arc::new(RecordingSink::new()),
            config(),
        );
        let report = archiver.run_once(now, &CancellationToken::new()).await.unwrap();
        assert_eq!(report, ArchiveReport { archived: 1, failed: 0 });

        let key = archive_key("bridge_x", "old");
        assert_eq!(objects.keys(), vec![key.clone()]);
        let body: Message = serde_json::from_slice(&objects.get(&key).unwrap()).unwrap();
        assert_eq!(body.message_id, "old");
        assert!(store.get("old").await.unwrap().unwrap().archived);
        assert!(!store.get("fresh").await.unwrap().unwrap().archived);

        // Nothing left to do on the next pass.
        let report = archiver.run_once(now, &CancellationToken::new()).await.unwrap();
        assert_eq!(report, ArchiveReport::default());
    }

    struct RejectingObjects;

    #[async_trait]
    impl ObjectStore for RejectingObjects {
        async fn put(&self, key: &str, _body: Vec<u8>) -> Result<(), ObjectStoreError> {
            Err(ObjectStoreError::Rejected {
                key: key.to_string(),
                reason: "bucket is read-only".into(),
            })
        }
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_not_marked() {
        let store = Arc::new(InMemoryMessageStore::new());
        let sink = Arc::new(RecordingSink::new());
        let now = Utc::now();
        store
            .upsert(&finalized("m1", now - chrono::Duration::hours(2)), None)
            .await
            .unwrap();

        let archiver = Archiver::new(store.clone(), Arc::new(RejectingObjects), sink.clone(), config());
        let report = archiver.run_once(now, &CancellationToken::new()).await.unwrap();
        assert_eq!(report, ArchiveReport { archived: 0, failed: 1 });
        assert_eq!(sink.count("archive_failure"), 1);
        match &sink.anomalies()[0] {
            Anomaly::ArchiveFailure { message_id, error } => {
                assert_eq!(message_id, "m1");
                assert!(error.contains(&archive_key("bridge_x", "m1")), "{error}");
                assert!(error.contains("bucket is read-only"), "{error}");
            }
            other => panic!("unexpected anomaly {other:?}"),
        }

        let stored: VersionedMessage = store.get("m1").await.unwrap().unwrap();
        assert!(!stored.archived);
    }

    #[tokio::test]
    async fn cancelled_pass_writes_nothing_more() {
        let store = Arc::new(InMemoryMessageStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let now = Utc::now();
        store
            .upsert(&finalized("m1", now - chrono::Duration::hours(2)), None)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let archiver = Archiver::new(store, objects.clone(), Arc::new(RecordingSink::new()), config());
        let report = archiver.run_once(now, &cancel).await.unwrap();
        assert_eq!(report, ArchiveReport::default());
        assert!(objects.keys().is_empty());
    }

    #[tokio::test]
    async fn archive_errors_say_which_step_failed() {
        let store = Arc::new(InMemoryMessageStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let message = finalized("ghost", Utc::now());

        let rejecting = Archiver::new(
            store.clone(),
            Arc::new(RejectingObjects),
            Arc::new(RecordingSink::new()),
            config(),
        );
        let err = rejecting.archive(&message).await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Put { ref key, .. } if *key == archive_key("bridge_x", "ghost")
        ));

        // Written, but the store has no such record to flag.
        let archiver = Archiver::new(store, objects.clone(), Arc::new(RecordingSink::new()), config());
        let err = archiver.archive(&message).await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Mark { source: StoreError::NotFound { .. }, .. }
        ));
        assert_eq!(objects.keys(), vec![archive_key("bridge_x", "ghost")]);
    }
}
