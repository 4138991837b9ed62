//! SQLite-backed history store.
//!
//! One row per sample with the attribute map as a JSON column, plus a
//! scores table so evaluations survive for trend charting. WAL mode for
//! concurrent readers; bounded retention prunes the oldest rows per device
//! after each append.
//!
//! v0.4: added the scores table and per-device retention pruning.

use super::{HistoryStore, WindowSpec};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use sentry_common::sample::AttributeSample;
use sentry_common::{HealthScore, SentryError, Severity, SubScores};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    retention_samples: usize,
}

fn store_err(e: impl std::fmt::Display) -> SentryError {
    SentryError::Store(e.to_string())
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open_at<P: AsRef<Path>>(
        path: P,
        retention_samples: usize,
    ) -> Result<Self, SentryError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }

        let conn = Connection::open(path_ref).map_err(store_err)?;

        // WAL for concurrent reads while the daemon appends
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(store_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                attributes TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_samples_device ON samples(device, id);

            CREATE TABLE IF NOT EXISTS scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                composite REAL NOT NULL,
                severity TEXT NOT NULL,
                rule_score REAL NOT NULL,
                trend_score REAL NOT NULL,
                anomaly_score REAL NOT NULL,
                confidence REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scores_device ON scores(device, id);
            "#,
        )
        .map_err(store_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            retention_samples,
        })
    }

    /// Recorded scores for one device, newest-first, up to `limit`.
    pub fn recent_scores(
        &self,
        device: &str,
        limit: usize,
    ) -> Result<Vec<HealthScore>, SentryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, composite, severity, rule_score, trend_score,
                        anomaly_score, confidence
                 FROM scores WHERE device = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map(params![device, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })
            .map_err(store_err)?;

        let mut scores = Vec::new();
        for row in rows {
            let (ts_ms, composite, severity, rule, trend, anomaly, confidence) =
                row.map_err(store_err)?;
            scores.push(HealthScore {
                device: device.to_string(),
                timestamp: Utc
                    .timestamp_millis_opt(ts_ms)
                    .single()
                    .ok_or_else(|| store_err(format!("bad timestamp {}", ts_ms)))?,
                composite,
                severity: parse_severity(&severity)?,
                breakdown: SubScores {
                    rule,
                    trend,
                    anomaly,
                },
                confidence,
            });
        }
        Ok(scores)
    }

    fn prune(&self, conn: &Connection, device: &str) -> Result<(), SentryError> {
        conn.execute(
            "DELETE FROM samples WHERE device = ?1 AND id NOT IN (
                 SELECT id FROM samples WHERE device = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![device, self.retention_samples as i64],
        )
        .map_err(store_err)?;
        Ok(())
    }
}

fn parse_severity(s: &str) -> Result<Severity, SentryError> {
    match s {
        "HEALTHY" => Ok(Severity::Healthy),
        "WARNING" => Ok(Severity::Warning),
        "CRITICAL" => Ok(Severity::Critical),
        other => Err(store_err(format!("unknown severity {}", other))),
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, sample: &AttributeSample) -> Result<(), SentryError> {
        let attributes = serde_json::to_string(&sample.attributes)?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO samples (device, timestamp_ms, attributes) VALUES (?1, ?2, ?3)",
            params![
                &sample.device,
                sample.timestamp.timestamp_millis(),
                attributes
            ],
        )
        .map_err(store_err)?;

        self.prune(&conn, &sample.device)
    }

    fn window(
        &self,
        device: &str,
        spec: WindowSpec,
    ) -> Result<Vec<AttributeSample>, SentryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        // Newest-first query bounded by the spec, reversed to oldest-first
        // on the way out; ordering is by insertion (rowid), which matches
        // time order because ingestion is monotonic per device.
        let (sql, limit_or_cutoff) = match spec {
            WindowSpec::LastN(n) => (
                "SELECT timestamp_ms, attributes FROM samples
                 WHERE device = ?1 ORDER BY id DESC LIMIT ?2",
                n as i64,
            ),
            WindowSpec::Since(duration) => (
                "SELECT timestamp_ms, attributes FROM samples
                 WHERE device = ?1 AND timestamp_ms >= ?2 ORDER BY id DESC",
                (Utc::now() - duration).timestamp_millis(),
            ),
        };

        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![device, limit_or_cutoff], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?;

        let mut samples = Vec::new();
        for row in rows {
            let (ts_ms, attributes) = row.map_err(store_err)?;
            samples.push(AttributeSample {
                device: device.to_string(),
                timestamp: Utc
                    .timestamp_millis_opt(ts_ms)
                    .single()
                    .ok_or_else(|| store_err(format!("bad timestamp {}", ts_ms)))?,
                attributes: serde_json::from_str(&attributes)?,
            });
        }
        samples.reverse();
        Ok(samples)
    }

    fn record_score(&self, score: &HealthScore) -> Result<(), SentryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO scores (device, timestamp_ms, composite, severity,
                                 rule_score, trend_score, anomaly_score, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &score.device,
                score.timestamp.timestamp_millis(),
                score.composite,
                score.severity.as_str(),
                score.breakdown.rule,
                score.breakdown.trend,
                score.breakdown.anomaly,
                score.confidence,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }
}
