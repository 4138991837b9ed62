//! Diagnostic sample model.
//!
//! One `AttributeSample` is one reading of one device at one point in time.
//! Samples are immutable after construction; the history store appends them
//! and the engine only ever reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical attribute names as reported by the telemetry collaborator.
///
/// Rule tables and trend direction maps key on these, but unknown
/// attributes flow through the engine untouched.
pub mod attrs {
    pub const REALLOCATED_SECTORS: &str = "reallocated_sectors";
    pub const PENDING_SECTORS: &str = "pending_sectors";
    pub const UNCORRECTABLE_ERRORS: &str = "uncorrectable_errors";
    pub const TEMPERATURE_CELSIUS: &str = "temperature_celsius";
    pub const POWER_ON_HOURS: &str = "power_on_hours";
    pub const MEDIA_ERRORS: &str = "media_errors";
    pub const UNSAFE_SHUTDOWNS: &str = "unsafe_shutdowns";
    pub const DISK_USAGE_PERCENT: &str = "disk_usage_percent";
    /// 1.0 when the device self-assessment passed, 0.0 when it failed.
    pub const SMART_PASSED: &str = "smart_passed";
}

/// Which way an attribute degrades.
///
/// Most SMART counters get worse as they grow (reallocated sectors);
/// a few get worse as they shrink (available reserved space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDirection {
    HigherIsWorse,
    LowerIsWorse,
}

impl Default for FailureDirection {
    fn default() -> Self {
        Self::HigherIsWorse
    }
}

/// One attribute reading: vendor raw value plus the normalized 0-255
/// indicator where the device reports one. Both are retained because rule
/// thresholds may target either.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    /// Vendor raw value (sector counts, hours, degrees Celsius, ...).
    pub raw: f64,

    /// Normalized health indicator (0-255 scale), when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<u8>,
}

impl AttributeValue {
    pub fn raw(raw: f64) -> Self {
        Self { raw, normalized: None }
    }

    pub fn with_normalized(raw: f64, normalized: u8) -> Self {
        Self {
            raw,
            normalized: Some(normalized),
        }
    }
}

/// One diagnostic sample for one device.
///
/// Attribute names map to raw/normalized value pairs. `BTreeMap` keeps
/// iteration order stable so scoring is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSample {
    /// Device identifier (e.g. "/dev/sda").
    pub device: String,

    /// When the sample was collected (UTC).
    pub timestamp: DateTime<Utc>,

    /// Attribute name -> value pair.
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeSample {
    pub fn new(device: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device: device.into(),
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion, used heavily by tests and the
    /// smartctl collector.
    pub fn with_attr(mut self, name: &str, value: AttributeValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Raw value of an attribute, if present.
    pub fn raw_value(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).map(|v| v.raw)
    }

    /// Normalized value of an attribute, if the device reported one.
    pub fn normalized_value(&self, name: &str) -> Option<f64> {
        self.attributes
            .get(name)
            .and_then(|v| v.normalized)
            .map(f64::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_attribute_lookup() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sample = AttributeSample::new("/dev/sda", ts)
            .with_attr(attrs::PENDING_SECTORS, AttributeValue::raw(2.0))
            .with_attr(
                attrs::REALLOCATED_SECTORS,
                AttributeValue::with_normalized(0.0, 100),
            );

        assert_eq!(sample.raw_value(attrs::PENDING_SECTORS), Some(2.0));
        assert_eq!(sample.normalized_value(attrs::PENDING_SECTORS), None);
        assert_eq!(
            sample.normalized_value(attrs::REALLOCATED_SECTORS),
            Some(100.0)
        );
        assert_eq!(sample.raw_value("nonexistent"), None);
    }

    #[test]
    fn test_sample_serde_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sample = AttributeSample::new("/dev/nvme0n1", ts)
            .with_attr(attrs::TEMPERATURE_CELSIUS, AttributeValue::raw(41.0));

        let json = serde_json::to_string(&sample).unwrap();
        let back: AttributeSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
