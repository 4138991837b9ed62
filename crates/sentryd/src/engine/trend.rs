//! Trend analyzer: adverse-slope detection over the history window.
//!
//! For each attribute in the rule table, fits a least-squares slope over
//! (timestamp, raw value) pairs and measures how far the latest value sits
//! from the window mean in standard deviations. The sub-score is the
//! worst-case (minimum) across attributes: one rapidly-degrading attribute
//! must dominate, not be averaged away.

use sentry_common::sample::{AttributeSample, FailureDirection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Variance below this is treated as a flat window (slope 0, deviation 0).
const VARIANCE_EPSILON: f64 = 1e-12;

/// Per-attribute trend statistics, reported for explainability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendStat {
    pub attribute: String,
    /// Fitted slope in raw units per hour.
    pub slope_per_hour: f64,
    /// Slope folded by the attribute's failure direction; never negative.
    pub adverse_slope: f64,
    /// Latest value's distance from the window mean, in stddev units.
    pub deviation: f64,
    /// Attribute score in [0, 1].
    pub score: f64,
}

/// Trend analysis output for one window.
#[derive(Debug, Clone)]
pub struct TrendReport {
    /// Minimum across attribute scores; exactly 1.0 when the window holds
    /// fewer than 2 samples (no evidence of decline).
    pub sub_score: f64,
    pub stats: Vec<TrendStat>,
}

impl TrendReport {
    fn neutral() -> Self {
        Self {
            sub_score: 1.0,
            stats: Vec::new(),
        }
    }

    /// The attribute driving the sub-score, if any declined.
    pub fn worst_attribute(&self) -> Option<&TrendStat> {
        self.stats
            .iter()
            .filter(|s| s.score < 1.0)
            .min_by(|a, b| a.score.total_cmp(&b.score))
    }
}

pub struct TrendAnalyzer {
    max_adverse_slope_per_hour: f64,
    directions: HashMap<String, FailureDirection>,
}

impl TrendAnalyzer {
    /// `directions` names the attributes of interest; lifetime counters
    /// like power_on_hours stay out of the map so their natural growth
    /// never reads as decline.
    pub fn new(
        max_adverse_slope_per_hour: f64,
        directions: impl IntoIterator<Item = (String, FailureDirection)>,
    ) -> Self {
        Self {
            max_adverse_slope_per_hour,
            directions: directions.into_iter().collect(),
        }
    }

    pub fn analyze(&self, window: &[AttributeSample]) -> TrendReport {
        if window.len() < 2 {
            return TrendReport::neutral();
        }

        let t0 = window[0].timestamp;
        let mut stats = Vec::new();

        for (attribute, direction) in &self.directions {
            let points: Vec<(f64, f64)> = window
                .iter()
                .filter_map(|s| {
                    s.raw_value(attribute).map(|v| {
                        let hours =
                            (s.timestamp - t0).num_milliseconds() as f64 / 3_600_000.0;
                        (hours, v)
                    })
                })
                .collect();

            if points.len() < 2 {
                continue;
            }

            let (slope, deviation) = slope_and_deviation(&points);
            let adverse_slope = match direction {
                FailureDirection::HigherIsWorse => slope.max(0.0),
                FailureDirection::LowerIsWorse => (-slope).max(0.0),
            };
            let score =
                1.0 - (adverse_slope / self.max_adverse_slope_per_hour).clamp(0.0, 1.0);

            stats.push(TrendStat {
                attribute: attribute.clone(),
                slope_per_hour: slope,
                adverse_slope,
                deviation,
                score,
            });
        }

        let sub_score = stats
            .iter()
            .map(|s| s.score)
            .fold(1.0, f64::min);

        TrendReport { sub_score, stats }
    }
}

/// Least-squares slope over (hours, value) plus the latest value's
/// deviation from the mean in stddev units. Zero-variance windows return
/// (0, 0) rather than dividing by nothing.
fn slope_and_deviation(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let mean_v = points.iter().map(|(_, v)| v).sum::<f64>() / n;
    let variance = points.iter().map(|(_, v)| (v - mean_v).powi(2)).sum::<f64>() / n;

    if variance < VARIANCE_EPSILON {
        return (0.0, 0.0);
    }

    let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let denom: f64 = points.iter().map(|(t, _)| (t - mean_t).powi(2)).sum();
    if denom < VARIANCE_EPSILON {
        // All samples share one timestamp; no slope to fit.
        return (0.0, 0.0);
    }
    let numer: f64 = points
        .iter()
        .map(|(t, v)| (t - mean_t) * (v - mean_v))
        .sum();
    let slope = numer / denom;

    let std = variance.sqrt();
    let latest = points.last().map(|(_, v)| *v).unwrap_or(mean_v);
    let deviation = (latest - mean_v) / std;

    (slope, deviation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};
    use sentry_common::sample::{attrs, AttributeValue};

    fn series(attribute: &str, values: &[f64]) -> Vec<AttributeSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                AttributeSample::new("/dev/sda", t0 + Duration::hours(i as i64))
                    .with_attr(attribute, AttributeValue::raw(*v))
            })
            .collect()
    }

    fn analyzer() -> TrendAnalyzer {
        TrendAnalyzer::new(
            10.0,
            [
                (
                    attrs::REALLOCATED_SECTORS.to_string(),
                    FailureDirection::HigherIsWorse,
                ),
                (
                    attrs::PENDING_SECTORS.to_string(),
                    FailureDirection::HigherIsWorse,
                ),
            ],
        )
    }

    #[test]
    fn test_single_sample_is_neutral() {
        let window = series(attrs::REALLOCATED_SECTORS, &[5.0]);
        let report = analyzer().analyze(&window);
        assert_eq!(report.sub_score, 1.0);
    }

    #[test]
    fn test_two_sample_adverse_growth_scores_below_one() {
        let window = series(attrs::REALLOCATED_SECTORS, &[0.0, 5.0]);
        let report = analyzer().analyze(&window);
        assert!(report.sub_score < 1.0);
        // 5 units over 1 hour against a max of 10/hour
        assert_relative_eq!(report.sub_score, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_flat_window_is_neutral() {
        let window = series(attrs::REALLOCATED_SECTORS, &[3.0, 3.0, 3.0, 3.0]);
        let report = analyzer().analyze(&window);
        assert_eq!(report.sub_score, 1.0);
        let stat = &report.stats[0];
        assert_eq!(stat.slope_per_hour, 0.0);
        assert_eq!(stat.deviation, 0.0);
    }

    #[test]
    fn test_slope_clamps_at_configured_maximum() {
        let window = series(attrs::REALLOCATED_SECTORS, &[0.0, 100.0]);
        let report = analyzer().analyze(&window);
        assert_eq!(report.sub_score, 0.0);
    }

    #[test]
    fn test_improving_attribute_is_not_adverse() {
        let analyzer = TrendAnalyzer::new(
            10.0,
            [(
                "available_reserved_space".to_string(),
                FailureDirection::LowerIsWorse,
            )],
        );
        let window = series("available_reserved_space", &[80.0, 90.0, 100.0]);
        let report = analyzer.analyze(&window);
        assert_eq!(report.sub_score, 1.0);
    }

    #[test]
    fn test_worst_attribute_dominates() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let window: Vec<AttributeSample> = (0..3)
            .map(|i| {
                AttributeSample::new("/dev/sda", t0 + Duration::hours(i))
                    .with_attr(
                        attrs::REALLOCATED_SECTORS,
                        AttributeValue::raw(i as f64), // 1/hour: mild
                    )
                    .with_attr(
                        attrs::PENDING_SECTORS,
                        AttributeValue::raw(8.0 * i as f64), // 8/hour: steep
                    )
            })
            .collect();

        let report = analyzer().analyze(&window);
        // Minimum across attributes, not an average.
        assert_relative_eq!(report.sub_score, 0.2, epsilon = 1e-9);
        assert_eq!(
            report.worst_attribute().unwrap().attribute,
            attrs::PENDING_SECTORS
        );
    }

    #[test]
    fn test_attribute_missing_from_window_is_skipped() {
        let window = series(attrs::TEMPERATURE_CELSIUS, &[30.0, 50.0]);
        // temperature is not in this analyzer's direction map
        let report = analyzer().analyze(&window);
        assert_eq!(report.sub_score, 1.0);
        assert!(report.stats.is_empty());
    }
}
