//! Backup decision state machine.
//!
//! One instance per monitored device, created on first observation and
//! kept for the lifetime of the daemon. Deterministic in (current state,
//! score, elapsed time, acknowledgments) — no hidden randomness. Cooldown
//! exit is duration-based: score recovery does not shorten it, so backups
//! cannot be re-triggered thrashingly by a score oscillating at the
//! threshold.
//!
//! v0.4.2: Cooldown -> BackupPending escalation on Critical severity,
//! behind `backup.escalate_in_cooldown`.

use crate::config::BackupConfig;
use chrono::{DateTime, Duration, Utc};
use sentry_common::{HealthScore, SentryError, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    Idle,
    BackupPending,
    BackupRunning,
    Cooldown,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::BackupPending => "BACKUP_PENDING",
            Self::BackupRunning => "BACKUP_RUNNING",
            Self::Cooldown => "COOLDOWN",
        }
    }
}

/// Decision policy derived from validated configuration.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    pub threshold: f64,
    pub consecutive_trigger: u32,
    pub cooldown: Duration,
    pub escalate_in_cooldown: bool,
}

impl DecisionPolicy {
    pub fn from_config(backup: &BackupConfig) -> Self {
        Self {
            threshold: backup.threshold,
            consecutive_trigger: backup.consecutive_trigger,
            cooldown: Duration::seconds(backup.cooldown_secs as i64),
            escalate_in_cooldown: backup.escalate_in_cooldown,
        }
    }
}

/// A state change, reported for audit logging and the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BackupState,
    pub to: BackupState,
}

/// Side effect the monitor must dispatch after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    RequestBackup,
}

/// Per-device decision state. Serializable so a daemon restart resumes
/// with the same subsequent decisions (cold start with no file is a fresh
/// Idle instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDecision {
    pub state: BackupState,
    pub state_since: DateTime<Utc>,
    pub last_trigger: Option<DateTime<Utc>>,
    pub below_streak: u32,
    pub above_streak: u32,
    #[serde(default)]
    pub dispatch_failures: u32,
}

impl BackupDecision {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: BackupState::Idle,
            state_since: now,
            last_trigger: None,
            below_streak: 0,
            above_streak: 0,
            dispatch_failures: 0,
        }
    }

    /// Feed one evaluation. Returns the transition taken (if any) and the
    /// side effect the caller must dispatch. The default is the self-loop
    /// no-op.
    pub fn observe(
        &mut self,
        score: &HealthScore,
        policy: &DecisionPolicy,
        now: DateTime<Utc>,
    ) -> (Option<Transition>, Option<DecisionAction>) {
        if score.composite <= policy.threshold {
            self.below_streak += 1;
            self.above_streak = 0;
        } else {
            self.above_streak += 1;
            self.below_streak = 0;
        }

        match self.state {
            BackupState::Idle => {
                if self.below_streak >= policy.consecutive_trigger {
                    let t = self.transition(BackupState::BackupPending, score, now);
                    (Some(t), Some(DecisionAction::RequestBackup))
                } else {
                    (None, None)
                }
            }
            BackupState::BackupPending => {
                // Dispatch failed previously; retry on this eligible cycle.
                (None, Some(DecisionAction::RequestBackup))
            }
            BackupState::BackupRunning => (None, None),
            BackupState::Cooldown => {
                if policy.escalate_in_cooldown && score.severity == Severity::Critical {
                    let t = self.transition(BackupState::BackupPending, score, now);
                    (Some(t), Some(DecisionAction::RequestBackup))
                } else if now - self.state_since >= policy.cooldown {
                    let t = self.transition(BackupState::Idle, score, now);
                    (Some(t), None)
                } else {
                    (None, None)
                }
            }
        }
    }

    /// The backup collaborator acknowledged the dispatch.
    pub fn on_backup_started(
        &mut self,
        score: &HealthScore,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.state != BackupState::BackupPending {
            return None;
        }
        self.last_trigger = Some(now);
        self.dispatch_failures = 0;
        Some(self.transition(BackupState::BackupRunning, score, now))
    }

    /// Dispatch was rejected: stay in BackupPending, count the failure.
    /// Returns the running failure count so the caller can alert past the
    /// configured bound.
    pub fn on_dispatch_failed(&mut self) -> u32 {
        self.dispatch_failures += 1;
        self.dispatch_failures
    }

    /// The backup collaborator reported completion. Success and failure
    /// both terminate the run into Cooldown; failure alerting is the
    /// caller's job.
    pub fn on_backup_complete(
        &mut self,
        device: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.state != BackupState::BackupRunning {
            warn!(
                device,
                state = self.state.as_str(),
                "ignoring backup completion outside BackupRunning"
            );
            return None;
        }
        let from = self.state;
        self.state = BackupState::Cooldown;
        self.state_since = now;
        info!(
            device,
            success,
            from = from.as_str(),
            to = self.state.as_str(),
            "backup finished"
        );
        Some(Transition {
            from,
            to: BackupState::Cooldown,
        })
    }

    fn transition(
        &mut self,
        to: BackupState,
        score: &HealthScore,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = self.state;
        self.state = to;
        self.state_since = now;
        info!(
            device = %score.device,
            composite = score.composite,
            from = from.as_str(),
            to = to.as_str(),
            at = %now.to_rfc3339(),
            "decision state transition"
        );
        Transition { from, to }
    }
}

/// Persist all decision states with an atomic rename so a crash mid-write
/// never leaves a torn file.
pub fn save_states(
    path: &Path,
    states: &HashMap<String, BackupDecision>,
) -> Result<(), SentryError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(states)?;
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Load decision states, tolerating cold start: a missing or unreadable
/// file is an empty map, and every device starts over in Idle.
pub fn load_states(path: &Path) -> HashMap<String, BackupDecision> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(states) => states,
            Err(e) => {
                warn!("Failed to parse decision state file: {}. Starting fresh.", e);
                HashMap::new()
            }
        },
        Err(e) => {
            warn!("Failed to read decision state file: {}. Starting fresh.", e);
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sentry_common::SubScores;

    fn policy(k: u32) -> DecisionPolicy {
        DecisionPolicy {
            threshold: 0.7,
            consecutive_trigger: k,
            cooldown: Duration::hours(24),
            escalate_in_cooldown: true,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn score(composite: f64) -> HealthScore {
        let severity = if composite >= 0.7 {
            Severity::Healthy
        } else if composite >= 0.4 {
            Severity::Warning
        } else {
            Severity::Critical
        };
        HealthScore {
            device: "/dev/sda".to_string(),
            timestamp: t0(),
            composite,
            severity,
            breakdown: SubScores {
                rule: composite,
                trend: composite,
                anomaly: composite,
            },
            confidence: 1.0,
        }
    }

    #[test]
    fn test_healthy_scores_never_leave_idle() {
        let mut d = BackupDecision::new(t0());
        let p = policy(1);
        for i in 0..50 {
            let (transition, action) =
                d.observe(&score(0.9), &p, t0() + Duration::hours(i));
            assert!(transition.is_none());
            assert!(action.is_none());
        }
        assert_eq!(d.state, BackupState::Idle);
    }

    #[test]
    fn test_hysteresis_requires_k_consecutive_breaches() {
        let mut d = BackupDecision::new(t0());
        let p = policy(3);

        // K-1 breaches then recovery: no trigger.
        d.observe(&score(0.5), &p, t0());
        d.observe(&score(0.5), &p, t0() + Duration::hours(1));
        d.observe(&score(0.9), &p, t0() + Duration::hours(2));
        assert_eq!(d.state, BackupState::Idle);
        assert_eq!(d.below_streak, 0);

        // Exactly K breaches: trigger.
        for i in 3..6 {
            d.observe(&score(0.5), &p, t0() + Duration::hours(i));
        }
        assert_eq!(d.state, BackupState::BackupPending);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut d = BackupDecision::new(t0());
        let (transition, action) = d.observe(&score(0.7), &policy(1), t0());
        assert_eq!(d.state, BackupState::BackupPending);
        assert_eq!(
            transition.unwrap(),
            Transition {
                from: BackupState::Idle,
                to: BackupState::BackupPending
            }
        );
        assert_eq!(action, Some(DecisionAction::RequestBackup));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut d = BackupDecision::new(t0());
        let p = policy(1);
        let s = score(0.4);

        d.observe(&s, &p, t0());
        assert_eq!(d.state, BackupState::BackupPending);

        d.on_backup_started(&s, t0());
        assert_eq!(d.state, BackupState::BackupRunning);
        assert_eq!(d.last_trigger, Some(t0()));

        // Completion (failure is terminal for this transition too).
        d.on_backup_complete("/dev/sda", false, t0() + Duration::hours(1));
        assert_eq!(d.state, BackupState::Cooldown);

        // Mid-cooldown recovery does not exit early.
        let (transition, _) = d.observe(&score(0.9), &p, t0() + Duration::hours(2));
        assert!(transition.is_none());
        assert_eq!(d.state, BackupState::Cooldown);

        // Cooldown expiry returns to Idle.
        let (transition, _) = d.observe(&score(0.9), &p, t0() + Duration::hours(26));
        assert_eq!(
            transition.unwrap(),
            Transition {
                from: BackupState::Cooldown,
                to: BackupState::Idle
            }
        );
    }

    #[test]
    fn test_critical_severity_escalates_out_of_cooldown() {
        let mut d = BackupDecision::new(t0());
        let p = policy(1);
        d.observe(&score(0.4), &p, t0());
        d.on_backup_started(&score(0.4), t0());
        d.on_backup_complete("/dev/sda", true, t0());

        // Warning-tier score during cooldown: stay put.
        let (_, action) = d.observe(&score(0.5), &p, t0() + Duration::hours(1));
        assert_eq!(d.state, BackupState::Cooldown);
        assert!(action.is_none());

        // Critical-tier score: early re-trigger.
        let (_, action) = d.observe(&score(0.1), &p, t0() + Duration::hours(2));
        assert_eq!(d.state, BackupState::BackupPending);
        assert_eq!(action, Some(DecisionAction::RequestBackup));
    }

    #[test]
    fn test_escalation_can_be_disabled() {
        let mut d = BackupDecision::new(t0());
        let mut p = policy(1);
        p.escalate_in_cooldown = false;
        d.observe(&score(0.4), &p, t0());
        d.on_backup_started(&score(0.4), t0());
        d.on_backup_complete("/dev/sda", true, t0());

        d.observe(&score(0.1), &p, t0() + Duration::hours(2));
        assert_eq!(d.state, BackupState::Cooldown);
    }

    #[test]
    fn test_dispatch_failure_stays_pending_and_counts() {
        let mut d = BackupDecision::new(t0());
        let p = policy(1);
        d.observe(&score(0.4), &p, t0());
        assert_eq!(d.on_dispatch_failed(), 1);
        assert_eq!(d.state, BackupState::BackupPending);

        // Next cycle retries.
        let (_, action) = d.observe(&score(0.4), &p, t0() + Duration::hours(1));
        assert_eq!(action, Some(DecisionAction::RequestBackup));
        assert_eq!(d.on_dispatch_failed(), 2);

        // Acknowledgment clears the failure count.
        d.on_backup_started(&score(0.4), t0() + Duration::hours(2));
        assert_eq!(d.dispatch_failures, 0);
    }

    #[test]
    fn test_spurious_completion_is_ignored() {
        let mut d = BackupDecision::new(t0());
        assert!(d.on_backup_complete("/dev/sda", true, t0()).is_none());
        assert_eq!(d.state, BackupState::Idle);
    }

    #[test]
    fn test_state_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("decision_state.json");

        let mut d = BackupDecision::new(t0());
        d.observe(&score(0.4), &policy(1), t0());
        let mut states = HashMap::new();
        states.insert("/dev/sda".to_string(), d.clone());

        save_states(&path, &states).unwrap();
        let loaded = load_states(&path);
        assert_eq!(loaded.get("/dev/sda"), Some(&d));
    }

    #[test]
    fn test_cold_start_is_empty() {
        let loaded = load_states(Path::new("/nonexistent/state.json"));
        assert!(loaded.is_empty());
    }
}
