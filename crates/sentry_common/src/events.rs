//! Events published to the alert/report sink.
//!
//! The engine emits scores, decision transitions and alerts; downstream
//! reporting and alerting consume them. The engine never renders
//! human-facing reports itself.

use crate::score::{HealthScore, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One event on the sink. Decision states travel as their audit labels so
/// consumers do not need the state machine types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SentryEvent {
    /// A completed evaluation for one device.
    ScoreEvaluated { score: HealthScore },

    /// The decision state machine moved.
    StateTransition {
        device: String,
        from: String,
        to: String,
        composite: f64,
        timestamp: DateTime<Utc>,
    },

    /// A backup was dispatched and acknowledged by the collaborator.
    BackupRequested {
        device: String,
        composite: f64,
        timestamp: DateTime<Utc>,
    },

    /// The backup collaborator reported completion.
    BackupFinished {
        device: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// An error condition surfaced with device context.
    Alert {
        device: String,
        severity: Severity,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl SentryEvent {
    pub fn alert(device: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self::Alert {
            device: device.to_string(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Device this event concerns.
    pub fn device(&self) -> &str {
        match self {
            Self::ScoreEvaluated { score } => &score.device,
            Self::StateTransition { device, .. }
            | Self::BackupRequested { device, .. }
            | Self::BackupFinished { device, .. }
            | Self::Alert { device, .. } => device,
        }
    }
}

/// Envelope written by persistent sinks: event plus a unique id for
/// downstream deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    #[serde(flatten)]
    pub event: SentryEvent,
}

impl EventRecord {
    pub fn new(event: SentryEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_device_accessor() {
        let event = SentryEvent::alert("/dev/sda", Severity::Warning, "read failed");
        assert_eq!(event.device(), "/dev/sda");
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = SentryEvent::BackupFinished {
            device: "/dev/sdb".into(),
            success: false,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"backup_finished\""));
        assert!(json.contains("\"success\":false"));
    }
}
