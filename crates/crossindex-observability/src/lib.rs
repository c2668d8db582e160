//! # crossindex-observability
//!
//! Logging, metrics, and anomaly reporting for CrossIndex.
//!
//! ## Structured logging
//! JSON-structured logs (ELK, Loki, CloudWatch) or human-readable text.
//! Log levels configurable per component.
//!
//! ## Metrics (OpenTelemetry)
//! - `crossindex.anomalies`: anomalies reported, by kind
//! - `crossindex.events_decoded`: events decoded per chain and protocol
//! - `crossindex.messages_created` / `crossindex.messages_finalized`
//! - `crossindex.orphans_escalated`: destination legs given up on, by reason
//!
//! ## Anomalies
//! [`TracingSink`] turns every reported [`Anomaly`](crossindex_core::Anomaly)
//! into a `warn` event with the anomaly's fields attached, and counts it in
//! `crossindex.anomalies`.

pub mod metrics;
pub mod sink;
pub mod tracing_setup;

pub use metrics::CrossIndexMetrics;
pub use sink::TracingSink;
pub use tracing_setup::{init_tracing, LogConfig};
