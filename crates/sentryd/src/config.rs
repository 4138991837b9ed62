//! Configuration management for sentryd.
//!
//! Loads settings from /etc/disksentry/config.toml. A missing file falls
//! back to compiled defaults with a warning (first-run behavior); a file
//! that parses or validates badly is fatal before the monitoring loop
//! starts. Invalid values are never silently replaced.

use crate::engine::rules::{default_rules, RulePolicy};
use sentry_common::SentryError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/disksentry/config.toml";

/// Weight-sum tolerance when validating scoring weights.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Monitoring loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Devices to monitor (e.g. "/dev/sda").
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,

    /// Evaluation interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_devices() -> Vec<String> {
    vec!["/dev/sda".to_string(), "/dev/sdb".to_string()]
}

fn default_poll_interval() -> u64 {
    3600 // hourly SMART polls
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Composite scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of the rule sub-score. Hard rule violations are more
    /// trustworthy evidence than statistical inference, so this dominates.
    #[serde(default = "default_rule_weight")]
    pub rule_weight: f64,

    /// Weight of the trend sub-score.
    #[serde(default = "default_trend_weight")]
    pub trend_weight: f64,

    /// Weight of the anomaly sub-score.
    #[serde(default = "default_anomaly_weight")]
    pub anomaly_weight: f64,

    /// Composite at or above this is Healthy.
    #[serde(default = "default_healthy_cutoff")]
    pub healthy_cutoff: f64,

    /// Composite at or above this (but below healthy) is Warning;
    /// below is Critical.
    #[serde(default = "default_warning_cutoff")]
    pub warning_cutoff: f64,
}

fn default_rule_weight() -> f64 {
    0.5
}

fn default_trend_weight() -> f64 {
    0.25
}

fn default_anomaly_weight() -> f64 {
    0.25
}

fn default_healthy_cutoff() -> f64 {
    0.7
}

fn default_warning_cutoff() -> f64 {
    0.4
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            rule_weight: default_rule_weight(),
            trend_weight: default_trend_weight(),
            anomaly_weight: default_anomaly_weight(),
            healthy_cutoff: default_healthy_cutoff(),
            warning_cutoff: default_warning_cutoff(),
        }
    }
}

/// Trend analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// History window size (samples) fed to the analyzer.
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,

    /// Adverse slope (raw units per hour) at which the trend sub-score
    /// bottoms out at 0.
    #[serde(default = "default_max_adverse_slope")]
    pub max_adverse_slope_per_hour: f64,
}

fn default_window_samples() -> usize {
    24 // one day of hourly samples
}

fn default_max_adverse_slope() -> f64 {
    10.0
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window_samples: default_window_samples(),
            max_adverse_slope_per_hour: default_max_adverse_slope(),
        }
    }
}

/// Anomaly detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Below this many training samples the detector reports the neutral
    /// score 1.0 instead of guessing.
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,
}

fn default_min_training_samples() -> usize {
    10
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_training_samples: default_min_training_samples(),
        }
    }
}

/// Backup decision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Composite score at or below this triggers the backup path.
    #[serde(default = "default_backup_threshold")]
    pub threshold: f64,

    /// Consecutive at-or-below-threshold evaluations required before
    /// triggering (hysteresis against transient noisy samples).
    #[serde(default = "default_consecutive_trigger")]
    pub consecutive_trigger: u32,

    /// Cooldown after a backup completes, in seconds. Duration-based:
    /// score recovery does not shorten it.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Dispatch failures tolerated before raising an alert.
    #[serde(default = "default_max_dispatch_retries")]
    pub max_dispatch_retries: u32,

    /// Allow Cooldown -> BackupPending early when severity reaches
    /// Critical.
    #[serde(default = "default_escalate_in_cooldown")]
    pub escalate_in_cooldown: bool,

    /// Backup command template dispatched by the executor; `{device}` is
    /// substituted. None logs the request instead of running anything.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_backup_threshold() -> f64 {
    0.7
}

fn default_consecutive_trigger() -> u32 {
    1
}

fn default_cooldown_secs() -> u64 {
    86_400 // one day between backups of the same device
}

fn default_max_dispatch_retries() -> u32 {
    3
}

fn default_escalate_in_cooldown() -> bool {
    true
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            threshold: default_backup_threshold(),
            consecutive_trigger: default_consecutive_trigger(),
            cooldown_secs: default_cooldown_secs(),
            max_dispatch_retries: default_max_dispatch_retries(),
            escalate_in_cooldown: default_escalate_in_cooldown(),
            command: None,
        }
    }
}

/// Persistence paths and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite history database.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Per-device samples kept before pruning the oldest.
    #[serde(default = "default_retention_samples")]
    pub retention_samples: usize,

    /// Decision-state snapshot (JSON, atomic rename).
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Append-only event audit log (JSONL). None disables the file sink.
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: Option<String>,
}

fn default_database_path() -> String {
    "/var/lib/disksentry/history.db".to_string()
}

fn default_retention_samples() -> usize {
    1000
}

fn default_state_path() -> String {
    "/var/lib/disksentry/decision_state.json".to_string()
}

fn default_audit_log_path() -> Option<String> {
    Some("/var/log/disksentry/events.jsonl".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention_samples: default_retention_samples(),
            state_path: default_state_path(),
            audit_log_path: default_audit_log_path(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub trend: TrendConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Per-attribute rule table.
    #[serde(default = "default_rules")]
    pub rules: Vec<RulePolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            scoring: ScoringConfig::default(),
            trend: TrendConfig::default(),
            anomaly: AnomalyConfig::default(),
            backup: BackupConfig::default(),
            store: StoreConfig::default(),
            rules: default_rules(),
        }
    }
}

impl Config {
    /// Load and validate. A missing file uses defaults; anything invalid
    /// is a `Configuration` error the caller must treat as fatal.
    pub fn load(path: &Path) -> Result<Self, SentryError> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                SentryError::Configuration(format!("cannot read {}: {}", path.display(), e))
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| {
                SentryError::Configuration(format!("invalid TOML in {}: {}", path.display(), e))
            })?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Config {} not found, using built-in defaults",
                path.display()
            );
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate every recognized option. Descriptive errors, no silent
    /// renormalization.
    pub fn validate(&self) -> Result<(), SentryError> {
        let cfg = |msg: String| Err(SentryError::Configuration(msg));

        if self.monitor.devices.is_empty() {
            return cfg("monitor.devices must list at least one device".into());
        }
        if self.monitor.poll_interval_secs == 0 {
            return cfg("monitor.poll_interval_secs must be at least 1".into());
        }

        let s = &self.scoring;
        for (name, w) in [
            ("rule_weight", s.rule_weight),
            ("trend_weight", s.trend_weight),
            ("anomaly_weight", s.anomaly_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return cfg(format!("scoring.{} must be in [0, 1], got {}", name, w));
            }
        }
        let sum = s.rule_weight + s.trend_weight + s.anomaly_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return cfg(format!(
                "scoring weights must sum to 1.0, got {} (weights are never renormalized)",
                sum
            ));
        }
        for (name, c) in [
            ("healthy_cutoff", s.healthy_cutoff),
            ("warning_cutoff", s.warning_cutoff),
        ] {
            if !(0.0..=1.0).contains(&c) {
                return cfg(format!("scoring.{} must be in [0, 1], got {}", name, c));
            }
        }
        if s.healthy_cutoff <= s.warning_cutoff {
            return cfg(format!(
                "scoring.healthy_cutoff ({}) must be above warning_cutoff ({})",
                s.healthy_cutoff, s.warning_cutoff
            ));
        }

        if self.trend.window_samples < 2 {
            return cfg("trend.window_samples must be at least 2".into());
        }
        if self.trend.max_adverse_slope_per_hour <= 0.0 {
            return cfg("trend.max_adverse_slope_per_hour must be positive".into());
        }

        if self.anomaly.min_training_samples == 0 {
            return cfg("anomaly.min_training_samples must be at least 1".into());
        }

        let b = &self.backup;
        if !(0.0..=1.0).contains(&b.threshold) {
            return cfg(format!(
                "backup.threshold must be in [0, 1], got {}",
                b.threshold
            ));
        }
        if b.consecutive_trigger == 0 {
            return cfg("backup.consecutive_trigger must be at least 1".into());
        }
        if b.cooldown_secs == 0 {
            return cfg("backup.cooldown_secs must be at least 1".into());
        }

        if self.store.retention_samples < self.trend.window_samples {
            return cfg(format!(
                "store.retention_samples ({}) must cover trend.window_samples ({})",
                self.store.retention_samples, self.trend.window_samples
            ));
        }

        for rule in &self.rules {
            rule.validate()?;
        }

        Ok(())
    }
}
