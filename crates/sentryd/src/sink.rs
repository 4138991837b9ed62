//! Alert/report sink.
//!
//! Downstream reporting and alerting consume `SentryEvent`s through this
//! interface; the daemon never formats human-facing reports. Publishing
//! must not fail the monitoring loop, so sink errors are logged and
//! swallowed.

use sentry_common::events::EventRecord;
use sentry_common::{SentryEvent, Severity};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &SentryEvent);
}

/// Emits events into the tracing stream at a level matching their weight.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &SentryEvent) {
        match event {
            SentryEvent::ScoreEvaluated { score } => info!(
                device = %score.device,
                composite = score.composite,
                severity = score.severity.as_str(),
                rule = score.breakdown.rule,
                trend = score.breakdown.trend,
                anomaly = score.breakdown.anomaly,
                confidence = score.confidence,
                "health score"
            ),
            SentryEvent::StateTransition {
                device,
                from,
                to,
                composite,
                ..
            } => info!(%device, %from, %to, composite, "state transition"),
            SentryEvent::BackupRequested { device, composite, .. } => {
                warn!(%device, composite, "backup requested")
            }
            SentryEvent::BackupFinished {
                device, success, ..
            } => {
                if *success {
                    info!(%device, "backup finished")
                } else {
                    error!(%device, "backup failed")
                }
            }
            SentryEvent::Alert {
                device,
                severity,
                message,
                ..
            } => match severity {
                Severity::Critical => error!(%device, "{}", message),
                Severity::Warning => warn!(%device, "{}", message),
                Severity::Healthy => info!(%device, "{}", message),
            },
        }
    }
}

/// Append-only JSONL audit log, one event record per line.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn try_append(&self, event: &SentryEvent) -> std::io::Result<()> {
        let record = EventRecord::new(event.clone());
        let json = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)
    }
}

impl EventSink for JsonlSink {
    fn publish(&self, event: &SentryEvent) {
        if let Err(e) = self.try_append(event) {
            error!(
                "failed to append event to {}: {}. Audit log will be incomplete.",
                self.path.display(),
                e
            );
        }
    }
}

/// Publishes to every inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &SentryEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_appends_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(&path);

        sink.publish(&SentryEvent::alert(
            "/dev/sda",
            Severity::Warning,
            "telemetry read failed",
        ));
        sink.publish(&SentryEvent::BackupFinished {
            device: "/dev/sda".to_string(),
            success: true,
            timestamp: Utc::now(),
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        // Every line parses back into a record with a unique id.
        let a: EventRecord = serde_json::from_str(lines[0]).unwrap();
        let b: EventRecord = serde_json::from_str(lines[1]).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_jsonl_sink_swallows_write_errors() {
        let sink = JsonlSink::new("/proc/invalid/events.jsonl");
        // Must not panic.
        sink.publish(&SentryEvent::alert("/dev/sda", Severity::Healthy, "ok"));
    }
}
