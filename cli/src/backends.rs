//! Storage backend selection from [`Settings`].

use std::sync::Arc;

use anyhow::Result;

use crossindex_core::{CheckpointStore, MemoryCheckpointStore, MessageStore, ObjectStore};
use crossindex_storage::InMemoryMessageStore;

use crate::settings::Settings;

pub struct Backends {
    pub messages: Arc<dyn MessageStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// `None` disables archiving.
    pub objects: Option<Arc<dyn ObjectStore>>,
}

/// Backend names compiled into this binary.
pub fn available() -> Vec<&'static str> {
    let mut names = vec!["memory"];
    if cfg!(feature = "postgres") {
        names.push("postgres");
    }
    if cfg!(feature = "s3") {
        names.push("s3");
    }
    names
}

pub async fn open(settings: &Settings) -> Result<Backends> {
    let (messages, checkpoints): (Arc<dyn MessageStore>, Arc<dyn CheckpointStore>) =
        match &settings.database {
            Some(db) => open_postgres(db).await?,
            None => {
                tracing::warn!("no database configured; messages and checkpoints are kept in memory");
                let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
                let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
                (messages, checkpoints)
            }
        };

    let objects = match &settings.object_storage {
        Some(store) => Some(open_s3(store)?),
        None => {
            tracing::warn!("no object storage configured; archiving is disabled");
            None
        }
    };

    Ok(Backends {
        messages,
        checkpoints,
        objects,
    })
}

#[cfg(feature = "postgres")]
async fn open_postgres(
    db: &crate::settings::DatabaseSettings,
) -> Result<(Arc<dyn MessageStore>, Arc<dyn CheckpointStore>)> {
    use anyhow::Context;
    use crossindex_storage::postgres::{PostgresOptions, PostgresStorage};

    let opts = PostgresOptions {
        max_connections: db.max_open_conns.max(1),
        min_connections: db.max_idle_conns.min(db.max_open_conns),
        ..PostgresOptions::default()
    };
    let storage = PostgresStorage::connect_with_options(&db.dsn(), opts)
        .await
        .with_context(|| format!("cannot connect to postgres at {}:{}/{}", db.host, db.port, db.dbname))?;
    let storage = Arc::new(storage);
    tracing::info!(host = %db.host, dbname = %db.dbname, "postgres store ready");
    let messages: Arc<dyn MessageStore> = storage.clone();
    let checkpoints: Arc<dyn CheckpointStore> = storage;
    Ok((messages, checkpoints))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(
    _db: &crate::settings::DatabaseSettings,
) -> Result<(Arc<dyn MessageStore>, Arc<dyn CheckpointStore>)> {
    anyhow::bail!("a database is configured but this binary was built without the `postgres` feature")
}

#[cfg(feature = "s3")]
fn open_s3(store: &crate::settings::ObjectStorageSettings) -> Result<Arc<dyn ObjectStore>> {
    use crossindex_storage::s3::{S3ObjectStore, S3Settings};

    let settings = S3Settings {
        endpoint: store.endpoint.clone(),
        access_key: store.access_key.clone(),
        secret_key: store.secret_key.clone(),
        bucket: store.bucket.clone(),
        region: store.region.clone(),
        use_ssl: store.use_ssl,
    };
    Ok(Arc::new(S3ObjectStore::new(&settings)))
}

#[cfg(not(feature = "s3"))]
fn open_s3(_store: &crate::settings::ObjectStorageSettings) -> Result<Arc<dyn ObjectStore>> {
    anyhow::bail!("object storage is configured but this binary was built without the `s3` feature")
}
