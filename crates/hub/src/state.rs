use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedEvents = Arc<RwLock<EventLog>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Recent notable events for the dashboard. Ephemeral: lost on restart.
pub struct EventLog {
    events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedEvents {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a committed telemetry reading.
    pub fn record_reading(&mut self, detail: String) {
        self.push(EventKind::Reading, detail);
    }

    /// Record an actuator command or reconciliation.
    pub fn record_actuator(&mut self, detail: String) {
        self.push(EventKind::Actuator, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push(EventKind::System, detail);
    }

    /// Events newest first.
    pub fn recent(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_newest_first() {
        let mut log = EventLog::new();
        log.record_system("hub started".into());
        log.record_reading("node1: temperature=24.5".into());
        log.record_error("node2: timeout".into());

        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kind, EventKind::Error);
        assert_eq!(recent[2].detail, "hub started");
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut log = EventLog::new();
        for i in 0..MAX_EVENTS + 5 {
            log.record_actuator(format!("event {i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_EVENTS);
        assert_eq!(recent[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(recent[MAX_EVENTS - 1].detail, "event 5");
    }

    #[test]
    fn event_kind_serialises_lowercase() {
        let json = serde_json::to_value(EventKind::Actuator).unwrap();
        assert_eq!(json, "actuator");
    }
}
