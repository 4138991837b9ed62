//! Health score model.
//!
//! The scorer emits one `HealthScore` per device per evaluation cycle.
//! Scores are derived outputs, not authoritative state; the history store
//! may retain them for trend charting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity tier derived from the composite score via configured cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Healthy,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// The three contributing sub-scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    /// Threshold rules applied to the current sample.
    pub rule: f64,
    /// Adverse-slope analysis over the history window.
    pub trend: f64,
    /// Statistical outlier score against the learned baseline.
    pub anomaly: f64,
}

/// Result of one evaluation: composite score in [0, 1] (1 = fully healthy),
/// severity tier, and the sub-score breakdown for explainability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub composite: f64,
    pub severity: Severity,
    pub breakdown: SubScores,

    /// How much history backed this evaluation, scaled to [0, 1]
    /// (1.0 once the window holds at least 100 samples).
    pub confidence: f64,
}

impl HealthScore {
    /// Confidence from the number of historical samples behind the
    /// evaluation: `min(n / 100, 1.0)`.
    pub fn confidence_from_history(samples: usize) -> f64 {
        (samples as f64 / 100.0).min(1.0)
    }
}
