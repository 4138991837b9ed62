//! Health scorer: weighted combination of the three sub-scores.
//!
//! Weights and severity cutoffs come from configuration and are validated
//! here as well as at config load; an invalid combination never produces a
//! silently-renormalized scorer.

use crate::config::ScoringConfig;
use chrono::{DateTime, Utc};
use sentry_common::{HealthScore, SentryError, Severity, SubScores};

pub struct HealthScorer {
    rule_weight: f64,
    trend_weight: f64,
    anomaly_weight: f64,
    healthy_cutoff: f64,
    warning_cutoff: f64,
}

impl HealthScorer {
    /// Fails fast on weights that do not sum to 1.0 or cutoffs out of
    /// order, mirroring config validation for callers that build a scorer
    /// directly.
    pub fn new(scoring: &ScoringConfig) -> Result<Self, SentryError> {
        let sum = scoring.rule_weight + scoring.trend_weight + scoring.anomaly_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(SentryError::Configuration(format!(
                "scoring weights must sum to 1.0, got {}",
                sum
            )));
        }
        if scoring.healthy_cutoff <= scoring.warning_cutoff {
            return Err(SentryError::Configuration(format!(
                "healthy_cutoff ({}) must be above warning_cutoff ({})",
                scoring.healthy_cutoff, scoring.warning_cutoff
            )));
        }

        Ok(Self {
            rule_weight: scoring.rule_weight,
            trend_weight: scoring.trend_weight,
            anomaly_weight: scoring.anomaly_weight,
            healthy_cutoff: scoring.healthy_cutoff,
            warning_cutoff: scoring.warning_cutoff,
        })
    }

    /// Deterministic, monotonic-in-inputs composite. `history_len` feeds
    /// the confidence field only; it never changes the score.
    pub fn compose(
        &self,
        device: &str,
        timestamp: DateTime<Utc>,
        breakdown: SubScores,
        history_len: usize,
    ) -> HealthScore {
        let composite = (self.rule_weight * breakdown.rule
            + self.trend_weight * breakdown.trend
            + self.anomaly_weight * breakdown.anomaly)
            .clamp(0.0, 1.0);

        HealthScore {
            device: device.to_string(),
            timestamp,
            composite,
            severity: self.severity(composite),
            breakdown,
            confidence: HealthScore::confidence_from_history(history_len),
        }
    }

    fn severity(&self, composite: f64) -> Severity {
        if composite >= self.healthy_cutoff {
            Severity::Healthy
        } else if composite >= self.warning_cutoff {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn scorer() -> HealthScorer {
        HealthScorer::new(&ScoringConfig::default()).unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_composite_is_the_weighted_sum() {
        let subs = SubScores {
            rule: 0.5,
            trend: 0.8,
            anomaly: 0.9,
        };
        let score = scorer().compose("/dev/sda", ts(), subs, 50);
        assert_relative_eq!(
            score.composite,
            0.5 * 0.5 + 0.25 * 0.8 + 0.25 * 0.9,
            epsilon = 1e-12
        );
        assert!(score.composite >= 0.0 && score.composite <= 1.0);
        assert_relative_eq!(score.confidence, 0.5);
    }

    #[test]
    fn test_severity_cutoffs() {
        let s = scorer();
        let make = |rule: f64| {
            s.compose(
                "/dev/sda",
                ts(),
                SubScores {
                    rule,
                    trend: rule,
                    anomaly: rule,
                },
                0,
            )
        };
        assert_eq!(make(1.0).severity, Severity::Healthy);
        assert_eq!(make(0.7).severity, Severity::Healthy);
        assert_eq!(make(0.5).severity, Severity::Warning);
        assert_eq!(make(0.1).severity, Severity::Critical);
    }

    #[test]
    fn test_critical_rule_pins_composite_below_backup_threshold() {
        // End-to-end property: rule 0.0 with default weights caps the
        // composite at 0.5, which is at or below the 0.7 threshold.
        let subs = SubScores {
            rule: 0.0,
            trend: 1.0,
            anomaly: 1.0,
        };
        let score = scorer().compose("/dev/sda", ts(), subs, 10);
        assert!(score.composite <= 0.7);
        assert_relative_eq!(score.composite, 0.5);
    }

    #[test]
    fn test_monotonic_in_each_sub_score() {
        let s = scorer();
        let base = s
            .compose(
                "/dev/sda",
                ts(),
                SubScores {
                    rule: 0.5,
                    trend: 0.5,
                    anomaly: 0.5,
                },
                0,
            )
            .composite;
        for better in [
            SubScores {
                rule: 0.6,
                trend: 0.5,
                anomaly: 0.5,
            },
            SubScores {
                rule: 0.5,
                trend: 0.6,
                anomaly: 0.5,
            },
            SubScores {
                rule: 0.5,
                trend: 0.5,
                anomaly: 0.6,
            },
        ] {
            assert!(s.compose("/dev/sda", ts(), better, 0).composite > base);
        }
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut cfg = ScoringConfig::default();
        cfg.anomaly_weight = 0.4;
        assert!(HealthScorer::new(&cfg).is_err());
    }

    #[test]
    fn test_unordered_cutoffs_rejected() {
        let mut cfg = ScoringConfig::default();
        cfg.warning_cutoff = 0.8;
        assert!(HealthScorer::new(&cfg).is_err());
    }
}
