//! Telemetry sink: injectable, fire-and-forget event recording.
//!
//! Recording never returns an error. A sink that cannot deliver an event
//! drops it; financial operations never wait on or roll back for telemetry.

use parking_lot::Mutex;
use tracing::info;

/// Event names emitted by the ledger.
pub mod events {
    pub const PURCHASE_VERIFIED: &str = "purchase.verified";
    pub const PURCHASE_REPLAY: &str = "purchase.replay";
    pub const PURCHASE_REJECTED: &str = "purchase.rejected";
    pub const RATE_LIMITED: &str = "abuse.rate_limited";
    pub const DUPLICATE_SUPPRESSED: &str = "abuse.duplicate_suppressed";
    pub const RECONCILIATION_DRIFT: &str = "reconciliation.drift";
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &str, attributes: &[(&str, String)]);
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: &str, _attributes: &[(&str, String)]) {}
}

/// Emits each event as a structured `tracing` record on the `telemetry` target.
#[derive(Debug, Clone, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &str, attributes: &[(&str, String)]) {
        let attrs = attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "telemetry", event, attributes = %attrs, "telemetry event");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl RecordedEvent {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        MemoryTelemetry::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Recorded events with the given name.
    pub fn named(&self, name: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record(&self, event: &str, attributes: &[(&str, String)]) {
        self.events.lock().push(RecordedEvent {
            name: event.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_telemetry_records_in_order() {
        let sink = MemoryTelemetry::new();
        sink.record(events::PURCHASE_REJECTED, &[("user_id", "alice".to_string())]);
        sink.record(events::RECONCILIATION_DRIFT, &[("difference", "-3".to_string())]);

        let all = sink.events();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, events::PURCHASE_REJECTED);
        assert_eq!(all[0].attribute("user_id"), Some("alice"));
        assert_eq!(sink.named(events::RECONCILIATION_DRIFT)[0].attribute("difference"), Some("-3"));
        assert!(sink.named(events::PURCHASE_VERIFIED).is_empty());
    }

    #[test]
    fn test_sinks_are_object_safe() {
        let sinks: Vec<Box<dyn TelemetrySink>> = vec![
            Box::new(NoopTelemetry),
            Box::new(TracingTelemetry),
            Box::new(MemoryTelemetry::new()),
        ];
        for sink in &sinks {
            sink.record(events::RATE_LIMITED, &[]);
        }
    }
}
