//! In-memory history store for tests and ephemeral runs.

use super::{HistoryStore, WindowSpec};
use chrono::Utc;
use sentry_common::sample::AttributeSample;
use sentry_common::{HealthScore, SentryError};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    samples: Mutex<HashMap<String, Vec<AttributeSample>>>,
    scores: Mutex<Vec<HealthScore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded scores, oldest-first. Test hook.
    pub fn scores(&self) -> Vec<HealthScore> {
        self.scores.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl HistoryStore for MemoryStore {
    fn append(&self, sample: &AttributeSample) -> Result<(), SentryError> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(sample.device.clone())
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    fn window(
        &self,
        device: &str,
        spec: WindowSpec,
    ) -> Result<Vec<AttributeSample>, SentryError> {
        let guard = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let all = match guard.get(device) {
            Some(samples) => samples.as_slice(),
            None => return Ok(Vec::new()),
        };

        Ok(match spec {
            WindowSpec::LastN(n) => {
                let start = all.len().saturating_sub(n);
                all[start..].to_vec()
            }
            WindowSpec::Since(duration) => {
                let cutoff = Utc::now() - duration;
                all.iter()
                    .filter(|s| s.timestamp >= cutoff)
                    .cloned()
                    .collect()
            }
        })
    }

    fn record_score(&self, score: &HealthScore) -> Result<(), SentryError> {
        self.scores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(score.clone());
        Ok(())
    }
}
