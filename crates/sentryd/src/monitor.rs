//! Monitoring loop.
//!
//! One interval-driven loop evaluates every configured device each cycle.
//! Devices are fanned out as concurrent tasks, one task per device per
//! cycle, so samples for a given device are processed strictly in
//! collection order while independent devices overlap. Per-device failures
//! are isolated: one device erroring never aborts the rest of the cycle.
//!
//! Suspension happens only at the inter-cycle select point. Shutdown lets
//! the in-flight cycle finish, saves decision states, and starts nothing
//! new.

use crate::backup::{BackupExecutor, BackupOutcome};
use crate::collectors::TelemetrySource;
use crate::config::Config;
use crate::decision::{self, BackupDecision, DecisionAction, DecisionPolicy};
use crate::engine::anomaly::AnomalyDetector;
use crate::engine::HealthEngine;
use crate::sink::EventSink;
use crate::store::{HistoryStore, WindowSpec};
use chrono::Utc;
use sentry_common::{SentryError, SentryEvent, Severity};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Per-device state owned by the monitor across cycles.
struct DeviceState {
    anomaly: Arc<AnomalyDetector>,
    decision: BackupDecision,
    /// Composite from the most recent evaluation, used when a completion
    /// report transitions the state machine between evaluations.
    last_composite: f64,
}

/// Shared collaborators cloned into each per-device task.
#[derive(Clone)]
struct CycleContext {
    engine: Arc<HealthEngine>,
    store: Arc<dyn HistoryStore>,
    telemetry: Arc<dyn TelemetrySource>,
    backup: Arc<dyn BackupExecutor>,
    sink: Arc<dyn EventSink>,
    policy: DecisionPolicy,
    window_samples: usize,
    max_dispatch_retries: u32,
}

pub struct Monitor {
    ctx: CycleContext,
    devices: HashMap<String, DeviceState>,
    poll_interval: Duration,
    state_path: PathBuf,
}

impl Monitor {
    /// Build from validated configuration. Reloads persisted decision
    /// states where present; unknown devices cold-start in Idle.
    pub fn new(
        config: &Config,
        store: Arc<dyn HistoryStore>,
        telemetry: Arc<dyn TelemetrySource>,
        backup: Arc<dyn BackupExecutor>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SentryError> {
        let engine = Arc::new(HealthEngine::from_config(config)?);
        let policy = DecisionPolicy::from_config(&config.backup);
        let state_path = PathBuf::from(&config.store.state_path);

        let saved = decision::load_states(&state_path);
        let now = Utc::now();
        let devices = config
            .monitor
            .devices
            .iter()
            .map(|device| {
                let decision = saved
                    .get(device)
                    .cloned()
                    .unwrap_or_else(|| BackupDecision::new(now));
                (
                    device.clone(),
                    DeviceState {
                        anomaly: Arc::new(AnomalyDetector::new(
                            config.anomaly.min_training_samples,
                        )),
                        decision,
                        last_composite: 1.0,
                    },
                )
            })
            .collect();

        Ok(Self {
            ctx: CycleContext {
                engine,
                store,
                telemetry,
                backup,
                sink,
                policy,
                window_samples: config.trend.window_samples,
                max_dispatch_retries: config.backup.max_dispatch_retries,
            },
            devices,
            poll_interval: Duration::from_secs(config.monitor.poll_interval_secs),
            state_path,
        })
    }

    /// Run until shutdown is signalled. Backup completions are applied
    /// between cycles; the in-flight cycle always finishes before exit.
    pub async fn run(
        mut self,
        mut outcomes: mpsc::UnboundedReceiver<BackupOutcome>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            devices = self.devices.len(),
            interval_secs = self.poll_interval.as_secs(),
            "monitoring loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                Some(outcome) = outcomes.recv() => {
                    self.apply_outcome(outcome);
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, finishing up");
                    break;
                }
            }
        }

        // Drain any completion reports that raced the shutdown signal so
        // the persisted states are not left in BackupRunning needlessly.
        while let Ok(outcome) = outcomes.try_recv() {
            self.apply_outcome(outcome);
        }
        self.save_states();
        info!("monitoring loop stopped");
    }

    /// Evaluate every device once. Public so `--once` mode and the
    /// integration tests can drive cycles directly.
    pub async fn run_cycle(&mut self) {
        let mut set = JoinSet::new();

        for (device, state) in self.devices.drain() {
            let ctx = self.ctx.clone();
            set.spawn(async move {
                let state = evaluate_device(&device, state, &ctx).await;
                (device, state)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((device, state)) => {
                    self.devices.insert(device, state);
                }
                Err(e) => {
                    // The device's state is lost with the task; it will
                    // cold-start next cycle only if re-added, so treat
                    // this as a bug worth shouting about.
                    error!("device evaluation task failed: {}", e);
                }
            }
        }

        self.save_states();
    }

    /// Apply an asynchronous backup completion report.
    pub fn apply_outcome(&mut self, outcome: BackupOutcome) {
        let now = Utc::now();
        let Some(state) = self.devices.get_mut(&outcome.device) else {
            warn!(
                device = %outcome.device,
                "backup completion for unmonitored device"
            );
            return;
        };

        if let Some(transition) =
            state
                .decision
                .on_backup_complete(&outcome.device, outcome.success, now)
        {
            self.ctx.sink.publish(&SentryEvent::StateTransition {
                device: outcome.device.clone(),
                from: transition.from.as_str().to_string(),
                to: transition.to.as_str().to_string(),
                composite: state.last_composite,
                timestamp: now,
            });
        }

        self.ctx.sink.publish(&SentryEvent::BackupFinished {
            device: outcome.device.clone(),
            success: outcome.success,
            timestamp: now,
        });
        if !outcome.success {
            self.ctx.sink.publish(&SentryEvent::alert(
                &outcome.device,
                Severity::Critical,
                "backup collaborator reported failure",
            ));
        }
    }

    /// Current decision state for a device. Test hook.
    pub fn decision_state(&self, device: &str) -> Option<&BackupDecision> {
        self.devices.get(device).map(|s| &s.decision)
    }

    fn save_states(&self) {
        let states: HashMap<String, BackupDecision> = self
            .devices
            .iter()
            .map(|(device, state)| (device.clone(), state.decision.clone()))
            .collect();
        if let Err(e) = decision::save_states(&self.state_path, &states) {
            error!("failed to persist decision states: {}", e);
        }
    }
}

/// One device, one cycle: read telemetry, append, score, decide, dispatch.
async fn evaluate_device(device: &str, mut state: DeviceState, ctx: &CycleContext) -> DeviceState {
    // Telemetry reads may block on hardware for a while.
    let telemetry = Arc::clone(&ctx.telemetry);
    let owned_device = device.to_string();
    let read = tokio::task::spawn_blocking(move || telemetry.read_attributes(&owned_device)).await;

    let sample = match read {
        Ok(Ok(sample)) => sample,
        Ok(Err(e)) => {
            // No sample this cycle: log, alert, retry next interval. The
            // decision state must not advance on missing evidence.
            warn!(device, "telemetry read failed: {}", e);
            ctx.sink
                .publish(&SentryEvent::alert(device, Severity::Warning, e.to_string()));
            return state;
        }
        Err(e) => {
            error!(device, "telemetry task failed: {}", e);
            return state;
        }
    };

    if let Err(e) = ctx.store.append(&sample) {
        error!(device, "history append failed: {}", e);
        ctx.sink
            .publish(&SentryEvent::alert(device, Severity::Critical, e.to_string()));
        return state; // skip scoring, retain prior decision state
    }

    let window = match ctx
        .store
        .window(device, WindowSpec::LastN(ctx.window_samples))
    {
        Ok(window) => window,
        Err(e) => {
            error!(device, "history read failed: {}", e);
            ctx.sink
                .publish(&SentryEvent::alert(device, Severity::Critical, e.to_string()));
            return state;
        }
    };

    let evaluation = ctx.engine.evaluate(&sample, &window, &state.anomaly);
    let score = evaluation.score;
    state.last_composite = score.composite;

    ctx.sink.publish(&SentryEvent::ScoreEvaluated {
        score: score.clone(),
    });
    if let Err(e) = ctx.store.record_score(&score) {
        // Score retention is best-effort charting data, not engine state.
        warn!(device, "failed to record score: {}", e);
    }

    let now = Utc::now();
    let (transition, action) = state.decision.observe(&score, &ctx.policy, now);
    if let Some(t) = transition {
        ctx.sink.publish(&SentryEvent::StateTransition {
            device: device.to_string(),
            from: t.from.as_str().to_string(),
            to: t.to.as_str().to_string(),
            composite: score.composite,
            timestamp: now,
        });
    }

    if let Some(DecisionAction::RequestBackup) = action {
        match ctx.backup.request_backup(device) {
            Ok(()) => {
                if let Some(t) = state.decision.on_backup_started(&score, now) {
                    ctx.sink.publish(&SentryEvent::StateTransition {
                        device: device.to_string(),
                        from: t.from.as_str().to_string(),
                        to: t.to.as_str().to_string(),
                        composite: score.composite,
                        timestamp: now,
                    });
                }
                ctx.sink.publish(&SentryEvent::BackupRequested {
                    device: device.to_string(),
                    composite: score.composite,
                    timestamp: now,
                });
            }
            Err(e) => {
                let failures = state.decision.on_dispatch_failed();
                error!(device, failures, "backup dispatch failed: {}", e);
                if failures > ctx.max_dispatch_retries {
                    ctx.sink.publish(&SentryEvent::alert(
                        device,
                        Severity::Critical,
                        format!(
                            "backup dispatch failed {} times: {}",
                            failures, e
                        ),
                    ));
                }
            }
        }
    }

    // Refit the baseline from the same window that was scored. Detached:
    // scoring keeps using the last completed snapshot until the swap.
    let detector = Arc::clone(&state.anomaly);
    let sink = Arc::clone(&ctx.sink);
    let owned_device = device.to_string();
    tokio::spawn(async move {
        if let Err(e) = detector.retrain(&window) {
            warn!(device = %owned_device, "model retrain failed: {}", e);
            sink.publish(&SentryEvent::alert(
                &owned_device,
                Severity::Warning,
                e.to_string(),
            ));
        }
    });

    state
}
