//! crossindex-storage — pluggable storage backends for CrossIndex.
//!
//! Backends:
//! - [`memory`] — in-memory message and object stores (dev/testing, no persistence)
//! - `postgres` — PostgreSQL via `sqlx`: messages and watcher checkpoints
//! - `s3` — S3-compatible object storage via `aws-sdk-s3` for the archive

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "s3")]
pub mod s3;

pub use memory::{InMemoryMessageStore, InMemoryObjectStore};
