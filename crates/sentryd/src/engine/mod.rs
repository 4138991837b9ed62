//! Health scoring engine.
//!
//! Combines the rule evaluator, trend analyzer and anomaly detector into
//! one composite score per evaluation. The engine itself is stateless; all
//! per-device state lives in the history store, the anomaly model and the
//! decision state machine.

pub mod anomaly;
pub mod rules;
pub mod scorer;
pub mod trend;

use crate::config::Config;
use self::anomaly::AnomalyDetector;
use self::rules::{FiredRule, RuleEvaluator};
use self::scorer::HealthScorer;
use self::trend::{TrendAnalyzer, TrendStat};
use sentry_common::sample::AttributeSample;
use sentry_common::{HealthScore, SentryError, SubScores};

/// One evaluation: the score plus the evidence behind it.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: HealthScore,
    pub fired_rules: Vec<FiredRule>,
    pub trend_stats: Vec<TrendStat>,
}

pub struct HealthEngine {
    rules: RuleEvaluator,
    trend: TrendAnalyzer,
    scorer: HealthScorer,
}

impl HealthEngine {
    /// Build from validated configuration. Scoring weights and cutoffs are
    /// re-checked here so a hand-built config cannot sneak past validation.
    pub fn from_config(config: &Config) -> Result<Self, SentryError> {
        for rule in &config.rules {
            rule.validate()?;
        }
        let rules = RuleEvaluator::new(config.rules.clone());
        let trend = TrendAnalyzer::new(
            config.trend.max_adverse_slope_per_hour,
            rules.directions(),
        );
        let scorer = HealthScorer::new(&config.scoring)?;
        Ok(Self {
            rules,
            trend,
            scorer,
        })
    }

    /// Score one sample against its history window (oldest-first, current
    /// sample included). Deterministic given identical inputs and an
    /// unchanged anomaly model.
    pub fn evaluate(
        &self,
        sample: &AttributeSample,
        window: &[AttributeSample],
        detector: &AnomalyDetector,
    ) -> Evaluation {
        let rule_report = self.rules.evaluate(sample);
        let trend_report = self.trend.analyze(window);
        let anomaly = detector.score(sample);

        let score = self.scorer.compose(
            &sample.device,
            sample.timestamp,
            SubScores {
                rule: rule_report.score,
                trend: trend_report.sub_score,
                anomaly,
            },
            window.len(),
        );

        Evaluation {
            score,
            fired_rules: rule_report.fired,
            trend_stats: trend_report.stats,
        }
    }
}
