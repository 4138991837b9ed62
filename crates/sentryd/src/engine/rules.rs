//! Rule evaluator: fixed per-attribute thresholds.
//!
//! Rules look at the current sample only; history never changes what a
//! hard threshold says. Worst fired tier wins across all attributes.

use sentry_common::sample::{attrs, AttributeSample, FailureDirection};
use sentry_common::{SentryError, Severity};
use serde::{Deserialize, Serialize};

/// Threshold predicate on a single attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Fires when value > limit.
    Above(f64),
    /// Fires when value < limit.
    Below(f64),
    /// Fires when value is outside [lo, hi].
    Outside([f64; 2]),
}

impl Predicate {
    pub fn matches(&self, value: f64) -> bool {
        match self {
            Self::Above(limit) => value > *limit,
            Self::Below(limit) => value < *limit,
            Self::Outside([lo, hi]) => value < *lo || value > *hi,
        }
    }

    fn validate(&self, attribute: &str) -> Result<(), SentryError> {
        if let Self::Outside([lo, hi]) = self {
            if lo >= hi {
                return Err(SentryError::Configuration(format!(
                    "rule for {}: outside bounds [{}, {}] are not ordered",
                    attribute, lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// Which side of the raw/normalized pair a rule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Raw,
    Normalized,
}

impl Default for ValueKind {
    fn default() -> Self {
        Self::Raw
    }
}

/// One row of the rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePolicy {
    /// Attribute the rule applies to.
    pub attribute: String,

    /// Warning-tier predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_if: Option<Predicate>,

    /// Critical-tier predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_if: Option<Predicate>,

    /// Raw or normalized target value.
    #[serde(default)]
    pub target: ValueKind,

    /// Failure direction, consumed by the trend analyzer for this
    /// attribute.
    #[serde(default)]
    pub direction: FailureDirection,
}

impl RulePolicy {
    pub fn validate(&self) -> Result<(), SentryError> {
        if self.warning_if.is_none() && self.critical_if.is_none() {
            return Err(SentryError::Configuration(format!(
                "rule for {} has neither warning_if nor critical_if",
                self.attribute
            )));
        }
        if let Some(p) = &self.warning_if {
            p.validate(&self.attribute)?;
        }
        if let Some(p) = &self.critical_if {
            p.validate(&self.attribute)?;
        }
        Ok(())
    }
}

/// Default rule table: physical failure indicators.
pub fn default_rules() -> Vec<RulePolicy> {
    fn rule(attribute: &str) -> RulePolicy {
        RulePolicy {
            attribute: attribute.to_string(),
            warning_if: None,
            critical_if: None,
            target: ValueKind::Raw,
            direction: FailureDirection::HigherIsWorse,
        }
    }

    vec![
        RulePolicy {
            warning_if: Some(Predicate::Above(0.0)),
            ..rule(attrs::REALLOCATED_SECTORS)
        },
        RulePolicy {
            critical_if: Some(Predicate::Above(0.0)),
            ..rule(attrs::PENDING_SECTORS)
        },
        RulePolicy {
            critical_if: Some(Predicate::Above(0.0)),
            ..rule(attrs::UNCORRECTABLE_ERRORS)
        },
        RulePolicy {
            warning_if: Some(Predicate::Above(0.0)),
            ..rule(attrs::MEDIA_ERRORS)
        },
        RulePolicy {
            warning_if: Some(Predicate::Outside([5.0, 55.0])),
            ..rule(attrs::TEMPERATURE_CELSIUS)
        },
        RulePolicy {
            warning_if: Some(Predicate::Above(90.0)),
            ..rule(attrs::DISK_USAGE_PERCENT)
        },
        RulePolicy {
            critical_if: Some(Predicate::Below(0.5)),
            direction: FailureDirection::LowerIsWorse,
            ..rule(attrs::SMART_PASSED)
        },
    ]
}

/// A rule that fired on the current sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiredRule {
    pub attribute: String,
    pub tier: Severity,
    pub value: f64,
}

/// Rule evaluation output: sub-score plus fired rules for explainability.
#[derive(Debug, Clone)]
pub struct RuleReport {
    pub score: f64,
    pub fired: Vec<FiredRule>,
}

/// Applies the rule table to one sample.
pub struct RuleEvaluator {
    policies: Vec<RulePolicy>,
}

impl RuleEvaluator {
    pub fn new(policies: Vec<RulePolicy>) -> Self {
        Self { policies }
    }

    /// Sub-score: 1.0 when nothing fires, 0.5 when the worst fired tier is
    /// Warning, 0.0 when any Critical rule fires.
    pub fn evaluate(&self, sample: &AttributeSample) -> RuleReport {
        let mut fired = Vec::new();

        for policy in &self.policies {
            let value = match policy.target {
                ValueKind::Raw => sample.raw_value(&policy.attribute),
                ValueKind::Normalized => sample.normalized_value(&policy.attribute),
            };
            let Some(value) = value else {
                continue; // attribute not reported this cycle
            };

            if policy.critical_if.map_or(false, |p| p.matches(value)) {
                fired.push(FiredRule {
                    attribute: policy.attribute.clone(),
                    tier: Severity::Critical,
                    value,
                });
            } else if policy.warning_if.map_or(false, |p| p.matches(value)) {
                fired.push(FiredRule {
                    attribute: policy.attribute.clone(),
                    tier: Severity::Warning,
                    value,
                });
            }
        }

        let score = if fired.iter().any(|f| f.tier == Severity::Critical) {
            0.0
        } else if fired.is_empty() {
            1.0
        } else {
            0.5
        };

        RuleReport { score, fired }
    }

    /// Failure directions per attribute, for the trend analyzer.
    pub fn directions(&self) -> Vec<(String, FailureDirection)> {
        self.policies
            .iter()
            .map(|p| (p.attribute.clone(), p.direction))
            .collect()
    }
}
