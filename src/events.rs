// src/events.rs
//
// Event emission: posts `{source, message, severity}` bodies to /events.

use serde::Serialize;

use crate::bus::client::BusWriter;

pub const EVENTS_URI: &str = "/events";

/// Event severity, lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Alarm,
    Fault,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub source: String,
    pub message: String,
    pub severity: Severity,
}

/// Post an event on the bus. Failures are logged, not propagated — events
/// are advisory and must never stall the I/O path.
pub async fn emit_event(bus: &BusWriter, source: &str, message: String, severity: Severity) {
    let event = Event {
        source: source.to_string(),
        message,
        severity,
    };
    let body = match serde_json::to_string(&event) {
        Ok(b) => b,
        Err(_) => return,
    };
    if let Err(e) = bus.send_post(EVENTS_URI, body).await {
        tlog!("[events] Failed to post event from {}: {}", source, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_body_shape() {
        let event = Event {
            source: "bms".to_string(),
            message: "heartbeat timeout".to_string(),
            severity: Severity::Fault,
        };
        let body: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(body["source"], "bms");
        assert_eq!(body["severity"], "fault");
        assert_eq!(body["message"], "heartbeat timeout");
    }
}
