//! History store: append-only per-device time series.
//!
//! The engine depends on this interface, not on a storage engine. Samples
//! come back oldest-first in insertion order; ingestion is monotonic per
//! device, so insertion order and time order agree. The store may also
//! retain scores for trend charting.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use sentry_common::sample::AttributeSample;
use sentry_common::{HealthScore, SentryError};

/// How much history to read back.
#[derive(Debug, Clone, Copy)]
pub enum WindowSpec {
    /// The most recent N samples.
    LastN(usize),
    /// Everything newer than now minus the duration.
    Since(chrono::Duration),
}

pub trait HistoryStore: Send + Sync {
    /// Append one sample. Fails with `Store` on persistence errors; the
    /// caller skips scoring for the device this cycle.
    fn append(&self, sample: &AttributeSample) -> Result<(), SentryError>;

    /// Samples for one device, oldest-first, possibly empty.
    fn window(
        &self,
        device: &str,
        spec: WindowSpec,
    ) -> Result<Vec<AttributeSample>, SentryError>;

    /// Retain an evaluation result alongside the samples it scored.
    fn record_score(&self, score: &HealthScore) -> Result<(), SentryError>;
}
