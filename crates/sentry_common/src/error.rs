//! Error taxonomy for DiskSentry.
//!
//! Per-device failures are isolated by the monitoring loop; only
//! `Configuration` is fatal, and only before the loop starts.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentryError {
    /// Telemetry collaborator could not reach the device. Skip this cycle,
    /// do not advance the decision state.
    #[error("device {device} unavailable")]
    DeviceUnavailable { device: String },

    /// Telemetry collaborator reached the device but the read failed.
    #[error("failed to read attributes from {device}: {reason}")]
    DeviceRead { device: String, reason: String },

    /// History persistence failure. Scoring is skipped for the device this
    /// cycle; the prior decision state is retained.
    #[error("history store error: {0}")]
    Store(String),

    /// Anomaly model retrain failed; the prior model stays in service.
    #[error("model training failed: {0}")]
    ModelTraining(String),

    /// Invalid configuration. Fatal at load time, before the monitoring
    /// loop runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backup collaborator rejected the dispatch; the state machine stays
    /// in BackupPending and retries on the next eligible cycle.
    #[error("backup dispatch for {device} failed: {reason}")]
    BackupDispatch { device: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SentryError {
    /// Whether the monitoring loop may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SentryError::Configuration(_))
    }
}
