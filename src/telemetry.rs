//! Counters and structured operational events.
//!
//! Counter ticks and event emission are side effects of the connect path and
//! must never fail an acquire; sink faults are contained here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

/// Severity of an operational event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Single structured event describing an operational observation, e.g. a
/// transient markdown of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    /// Short machine-readable code such as `TMARKDOWN`.
    pub code: String,
    /// Schema version of the event payload.
    pub version: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Receives structured events. Implementations forward to an external alarm
/// pipeline; they should not block.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &TelemetryEvent);
}

/// Default sink: renders events into the tracing stream.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn event(&self, event: &TelemetryEvent) {
        match event.severity {
            EventSeverity::Info => {
                info!(code = %event.code, version = event.version, details = %event.details, "telemetry event")
            }
            EventSeverity::Warning => {
                warn!(code = %event.code, version = event.version, details = %event.details, "telemetry event")
            }
            EventSeverity::Error => {
                error!(code = %event.code, version = event.version, details = %event.details, "telemetry event")
            }
        }
    }
}

/// Bounded in-memory sink, useful for tests and local inspection.
#[derive(Debug)]
pub struct EventHistory {
    events: Mutex<VecDeque<TelemetryEvent>>,
    max_events: usize,
}

impl EventHistory {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.max(1))),
            max_events: max_events.max(1),
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl EventSink for EventHistory {
    fn event(&self, event: &TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event.clone());
            while events.len() > self.max_events {
                events.pop_front();
            }
        }
    }
}

/// Counter registry plus the event sink handle.
pub struct Telemetry {
    intervals: DashMap<String, AtomicU64>,
    sink: RwLock<Arc<dyn EventSink>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            intervals: DashMap::new(),
            sink: RwLock::new(Arc::new(TracingEventSink)),
        }
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the named counter, creating it on first use.
    pub fn tick(&self, name: &str) {
        if let Some(counter) = self.intervals.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.intervals
            .entry(name.to_string())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the named counter; zero when never ticked.
    pub fn count(&self, name: &str) -> u64 {
        self.intervals
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Replace the event sink.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = sink;
        }
    }

    /// Emit a structured event. A panicking sink is swallowed; the connect
    /// path must not observe telemetry faults.
    pub fn event(&self, severity: EventSeverity, code: &str, version: u32, details: Value) {
        let sink = match self.sink.read() {
            Ok(slot) => Arc::clone(&*slot),
            Err(_) => return,
        };
        let event = TelemetryEvent {
            timestamp: Utc::now(),
            severity,
            code: code.to_string(),
            version,
            details,
        };
        let _ = catch_unwind(AssertUnwindSafe(|| sink.event(&event)));
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("counters", &self.intervals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counters_tick_independently() {
        let telemetry = Telemetry::new();
        telemetry.tick("net.markdowns");
        telemetry.tick("net.markdowns");
        telemetry.tick("net.out_of_sockets");

        assert_eq!(telemetry.count("net.markdowns"), 2);
        assert_eq!(telemetry.count("net.out_of_sockets"), 1);
        assert_eq!(telemetry.count("never.ticked"), 0);
    }

    #[test]
    fn history_sink_records_and_trims() {
        let telemetry = Telemetry::new();
        let history = Arc::new(EventHistory::new(2));
        telemetry.set_event_sink(history.clone());

        for i in 0..3 {
            telemetry.event(EventSeverity::Error, "TMARKDOWN", 2, json!({ "seq": i }));
        }

        let events = history.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].details["seq"], 1);
        assert_eq!(events[1].code, "TMARKDOWN");
    }

    #[test]
    fn panicking_sink_does_not_reach_the_caller() {
        struct Exploding;
        impl EventSink for Exploding {
            fn event(&self, _: &TelemetryEvent) {
                panic!("sink fault");
            }
        }

        let telemetry = Telemetry::new();
        telemetry.set_event_sink(Arc::new(Exploding));
        telemetry.event(EventSeverity::Info, "PROBE", 1, Value::Null);
    }
}
