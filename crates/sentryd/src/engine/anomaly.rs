//! Anomaly detector: per-device statistical baseline.
//!
//! The model is a per-attribute Gaussian summary fitted over the history
//! window. The raw outlier score of a sample is the largest |z| across the
//! attributes the model knows; a logistic map turns that into a sub-score
//! in (0, 1] so downstream combination stays model-agnostic (1.0 typical,
//! approaching 0 highly anomalous).
//!
//! The live model is an immutable versioned snapshot behind a lock.
//! Retraining fits a candidate off-lock and swaps it in atomically, so a
//! scoring read always sees the last completed model, never a partial one,
//! and a failed retrain simply leaves the prior model in service.

use sentry_common::sample::AttributeSample;
use sentry_common::SentryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Logistic normalization: midpoint and steepness in z units.
const Z_MIDPOINT: f64 = 3.0;
const Z_STEEPNESS: f64 = 1.2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FeatureStats {
    mean: f64,
    std: f64,
}

/// Immutable fitted model. Cheap to clone behind an `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyModel {
    /// Bumped on every completed retrain.
    pub version: u64,
    /// Samples the model was fitted on.
    pub trained_on: usize,
    stats: BTreeMap<String, FeatureStats>,
}

impl AnomalyModel {
    fn fit(window: &[AttributeSample], version: u64) -> Self {
        let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for sample in window {
            for (name, value) in &sample.attributes {
                values.entry(name.as_str()).or_default().push(value.raw);
            }
        }

        let stats = values
            .into_iter()
            .map(|(name, vs)| {
                let n = vs.len() as f64;
                let mean = vs.iter().sum::<f64>() / n;
                let variance = vs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                (
                    name.to_string(),
                    FeatureStats {
                        mean,
                        std: variance.sqrt(),
                    },
                )
            })
            .collect();

        Self {
            version,
            trained_on: window.len(),
            stats,
        }
    }

    /// Largest |z| across attributes shared by model and sample.
    /// Zero-stddev features contribute nothing: a constant attribute that
    /// moves at all is the rule evaluator's business, not a z-score's.
    fn max_z(&self, sample: &AttributeSample) -> f64 {
        let mut max_z: f64 = 0.0;
        for (name, value) in &sample.attributes {
            if let Some(stats) = self.stats.get(name) {
                if stats.std > 0.0 {
                    max_z = max_z.max(((value.raw - stats.mean) / stats.std).abs());
                }
            }
        }
        max_z
    }
}

pub struct AnomalyDetector {
    min_training_samples: usize,
    model: RwLock<Arc<AnomalyModel>>,
}

impl AnomalyDetector {
    pub fn new(min_training_samples: usize) -> Self {
        Self {
            min_training_samples,
            model: RwLock::new(Arc::new(AnomalyModel::default())),
        }
    }

    /// Last completed model snapshot.
    pub fn snapshot(&self) -> Arc<AnomalyModel> {
        self.model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Anomaly sub-score in (0, 1]. Exactly 1.0 while the model has fewer
    /// than the minimum training samples: no baseline, no opinion, no
    /// false positives during cold start.
    pub fn score(&self, sample: &AttributeSample) -> f64 {
        let model = self.snapshot();
        if model.trained_on < self.min_training_samples {
            return 1.0;
        }
        normalize(model.max_z(sample))
    }

    /// Refit from the given window and swap the snapshot. On failure the
    /// prior model stays in service and scoring continues unaffected.
    pub fn retrain(&self, window: &[AttributeSample]) -> Result<(), SentryError> {
        if window.is_empty() {
            return Err(SentryError::ModelTraining(
                "cannot fit a model on an empty window".to_string(),
            ));
        }

        let next_version = self.snapshot().version + 1;
        let candidate = Arc::new(AnomalyModel::fit(window, next_version));

        let mut guard = self.model.write().unwrap_or_else(|e| e.into_inner());
        *guard = candidate;
        Ok(())
    }
}

/// Monotonic map from max |z| to (0, 1]: ~1 near z = 0, ~0.5 at the
/// midpoint, approaching 0 for extreme outliers.
fn normalize(max_z: f64) -> f64 {
    1.0 / (1.0 + (Z_STEEPNESS * (max_z - Z_MIDPOINT)).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use sentry_common::sample::{attrs, AttributeValue};

    fn temp_series(values: &[f64]) -> Vec<AttributeSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                AttributeSample::new("/dev/sda", t0 + Duration::hours(i as i64))
                    .with_attr(attrs::TEMPERATURE_CELSIUS, AttributeValue::raw(*v))
            })
            .collect()
    }

    fn temp_sample(value: f64) -> AttributeSample {
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        AttributeSample::new("/dev/sda", ts)
            .with_attr(attrs::TEMPERATURE_CELSIUS, AttributeValue::raw(value))
    }

    #[test]
    fn test_cold_start_scores_exactly_one() {
        let detector = AnomalyDetector::new(10);
        // Untrained
        assert_eq!(detector.score(&temp_sample(500.0)), 1.0);
        // Trained, but on fewer samples than the minimum
        detector.retrain(&temp_series(&[35.0, 36.0, 35.0])).unwrap();
        assert_eq!(detector.score(&temp_sample(500.0)), 1.0);
    }

    #[test]
    fn test_typical_sample_scores_near_one() {
        let detector = AnomalyDetector::new(10);
        let window = temp_series(&[34.0, 35.0, 36.0, 35.0, 34.0, 35.0, 36.0, 35.0, 34.0, 36.0]);
        detector.retrain(&window).unwrap();
        assert!(detector.score(&temp_sample(35.0)) > 0.9);
    }

    #[test]
    fn test_outlier_scores_near_zero() {
        let detector = AnomalyDetector::new(10);
        let window = temp_series(&[34.0, 35.0, 36.0, 35.0, 34.0, 35.0, 36.0, 35.0, 34.0, 36.0]);
        detector.retrain(&window).unwrap();
        let score = detector.score(&temp_sample(80.0));
        assert!(score < 0.1, "outlier scored {}", score);
    }

    #[test]
    fn test_normalization_is_monotonic() {
        let mut last = normalize(0.0);
        for z in [0.5, 1.0, 2.0, 3.0, 5.0, 10.0] {
            let s = normalize(z);
            assert!(s < last);
            assert!(s > 0.0 && s <= 1.0);
            last = s;
        }
    }

    #[test]
    fn test_retrain_bumps_version_and_failure_keeps_model() {
        let detector = AnomalyDetector::new(3);
        let window = temp_series(&[34.0, 35.0, 36.0, 35.0]);
        detector.retrain(&window).unwrap();
        let v1 = detector.snapshot().version;
        assert_eq!(v1, 1);

        // Failed retrain keeps the prior model in service.
        assert!(detector.retrain(&[]).is_err());
        let after = detector.snapshot();
        assert_eq!(after.version, v1);
        assert_eq!(after.trained_on, 4);
    }

    #[test]
    fn test_unknown_attributes_are_ignored() {
        let detector = AnomalyDetector::new(2);
        detector.retrain(&temp_series(&[35.0, 36.0, 34.0])).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let sample = AttributeSample::new("/dev/sda", ts)
            .with_attr("never_seen_before", AttributeValue::raw(1e9));
        // Nothing the model knows deviates, so the sample reads typical.
        assert!(detector.score(&sample) > 0.9);
    }
}
