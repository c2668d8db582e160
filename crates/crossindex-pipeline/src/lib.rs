//! crossindex-pipeline — turns decoded events into messages and archives them.
//!
//! - [`Normalizer`]: correlates origination and destination legs, holding
//!   early destination legs in an [`OrphanQueue`]
//! - [`NormalizerService`]: the task that feeds watcher batches through it
//! - [`Archiver`]: exports finalized messages to object storage
//! - [`Pipeline`]: runs watchers, normalizer and archiver under one
//!   cancellation token

pub mod archiver;
pub mod normalizer;
pub mod orphans;
pub mod runner;
pub mod service;

pub use archiver::{archive_key, ArchiveError, ArchiveReport, Archiver, ArchiverConfig};
pub use normalizer::{NormalizeError, Normalizer, NormalizerConfig, NormalizerStats, Outcome};
pub use orphans::{Orphan, OrphanPolicy, OrphanQueue, Reschedule};
pub use runner::{Pipeline, PipelineConfig, PipelineReport};
pub use service::NormalizerService;
