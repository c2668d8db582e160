//! [`AnomalySink`] backed by `tracing` and the anomaly counter.

use crossindex_core::{Anomaly, AnomalySink};

use crate::metrics::CrossIndexMetrics;

/// Logs each anomaly as a `warn` event and counts it in
/// `crossindex.anomalies`, labelled by kind.
#[derive(Clone)]
pub struct TracingSink {
    metrics: CrossIndexMetrics,
}

impl TracingSink {
    pub fn new(metrics: CrossIndexMetrics) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &CrossIndexMetrics {
        &self.metrics
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(CrossIndexMetrics::global())
    }
}

impl AnomalySink for TracingSink {
    fn report(&self, anomaly: Anomaly) {
        self.metrics.record_anomaly(&anomaly);

        let kind = anomaly.kind();
        let details = serde_json::to_string(&anomaly).unwrap_or_default();
        match anomaly.chain_id() {
            Some(chain_id) => {
                tracing::warn!(target: "crossindex::anomaly", kind, chain_id, %details, "{anomaly}");
            }
            None => {
                tracing::warn!(target: "crossindex::anomaly", kind, %details, "{anomaly}");
            }
        }
    }
}
