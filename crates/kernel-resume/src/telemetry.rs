//! Telemetry events.
//!
//! Events are fire-and-forget: sinks never report failures back to the
//! caller.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// The direct in-process transport is usable on this machine.
pub const RAW_TRANSPORT_SUPPORTED: &str = "raw_transport_supported";
/// The direct in-process transport is not usable; kernels must be reached
/// through a server.
pub const RAW_TRANSPORT_NOT_SUPPORTED: &str = "raw_transport_not_supported";

/// A telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TelemetryEvent {
    /// Create a new event with the current timestamp.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Destination for telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn send_event(&self, event: TelemetryEvent);
}

/// Sink that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn send_event(&self, event: TelemetryEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!("[telemetry] {}", json),
            Err(e) => log::debug!("[telemetry] Failed to serialize {}: {}", event.event_type, e),
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingTelemetry {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events of `event_type`.
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn send_event(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
