//! CrossIndex metrics definitions.
//!
//! All metrics use OpenTelemetry conventions and go through whatever
//! `MeterProvider` the binary installs. Without one, the global meter is a
//! no-op and recording costs nothing.

use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};

use crossindex_core::{Anomaly, MessageStatus};

/// Instrumentation scope for every CrossIndex instrument.
pub const METER_NAME: &str = "crossindex";

/// Central metrics handle for CrossIndex.
#[derive(Clone)]
pub struct CrossIndexMetrics {
    pub anomalies: Counter<u64>,
    pub events_decoded: Counter<u64>,
    pub messages_created: Counter<u64>,
    pub messages_finalized: Counter<u64>,
    pub orphans_escalated: Counter<u64>,
}

impl CrossIndexMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            anomalies: meter
                .u64_counter("crossindex.anomalies")
                .with_description("Anomalies reported, by kind")
                .build(),
            events_decoded: meter
                .u64_counter("crossindex.events_decoded")
                .with_description("Bridge events decoded from chain logs")
                .build(),
            messages_created: meter
                .u64_counter("crossindex.messages_created")
                .with_description("Messages first recorded by the normalizer")
                .build(),
            messages_finalized: meter
                .u64_counter("crossindex.messages_finalized")
                .with_description("Messages that reached a terminal status")
                .build(),
            orphans_escalated: meter
                .u64_counter("crossindex.orphans_escalated")
                .with_description("Destination legs that gave up waiting for their origination")
                .build(),
        }
    }

    /// Instruments on the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }

    pub fn record_anomaly(&self, anomaly: &Anomaly) {
        self.anomalies.add(1, &anomaly_attributes(anomaly));
    }

    pub fn record_decoded(&self, chain_id: u64, protocol: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.events_decoded.add(
            count,
            &[
                KeyValue::new("chain_id", chain_id as i64),
                KeyValue::new("protocol", protocol.to_string()),
            ],
        );
    }

    pub fn record_created(&self, protocol: &str, chain_id: u64) {
        self.messages_created.add(
            1,
            &[
                KeyValue::new("protocol", protocol.to_string()),
                KeyValue::new("chain_id", chain_id as i64),
            ],
        );
    }

    pub fn record_finalized(&self, protocol: &str, status: MessageStatus) {
        self.messages_finalized.add(
            1,
            &[
                KeyValue::new("protocol", protocol.to_string()),
                KeyValue::new("status", status.as_str()),
            ],
        );
    }

    pub fn record_orphan_escalated(&self, chain_id: u64, reason: &str) {
        self.orphans_escalated.add(
            1,
            &[
                KeyValue::new("chain_id", chain_id as i64),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }
}

/// Labels attached to `crossindex.anomalies`.
pub fn anomaly_attributes(anomaly: &Anomaly) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("kind", anomaly.kind())];
    if let Some(chain_id) = anomaly.chain_id() {
        attrs.push(KeyValue::new("chain_id", chain_id as i64));
    }
    if let Anomaly::DecodeFailure { protocol, .. } = anomaly {
        attrs.push(KeyValue::new("protocol", protocol.clone()));
    }
    attrs
}
