//! Telemetry collaborators.
//!
//! The engine only sees the `TelemetrySource` trait; how attributes leave
//! the hardware is this module's business. The shipped implementation
//! shells out to smartctl and merges filesystem usage from sysinfo.

use chrono::Utc;
use sentry_common::sample::{attrs, AttributeSample, AttributeValue};
use sentry_common::SentryError;
use std::process::Command;
use sysinfo::Disks;

/// Reads one device's diagnostic attributes. Implementations must be
/// cheap to share across per-device evaluation tasks.
pub trait TelemetrySource: Send + Sync {
    fn read_attributes(&self, device: &str) -> Result<AttributeSample, SentryError>;
}

/// smartctl-backed telemetry source.
///
/// Invokes `smartctl -H -A -j <device>` and parses the JSON attribute
/// table (ATA ids 5/197/198/9/194 plus the NVMe health log), falling back
/// to the plain-text table when JSON is unavailable. Optionally merges
/// filesystem usage so a filling disk shows up as telemetry too.
pub struct SmartctlSource {
    include_disk_usage: bool,
}

impl SmartctlSource {
    pub fn new() -> Self {
        Self {
            include_disk_usage: true,
        }
    }

    pub fn without_disk_usage(mut self) -> Self {
        self.include_disk_usage = false;
        self
    }
}

impl Default for SmartctlSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SmartctlSource {
    fn read_attributes(&self, device: &str) -> Result<AttributeSample, SentryError> {
        let output = Command::new("smartctl")
            .args(["-H", "-A", "-j", device])
            .output()
            .map_err(|e| SentryError::DeviceRead {
                device: device.to_string(),
                reason: format!("failed to run smartctl: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
            return Err(SentryError::DeviceRead {
                device: device.to_string(),
                reason: "smartctl requires root".to_string(),
            });
        }

        let mut sample = AttributeSample::new(device, Utc::now());

        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&stdout) {
            merge_smartctl_json(&mut sample, &json);
        } else {
            merge_smartctl_text(&mut sample, &stdout);
        }

        if sample.attributes.is_empty() {
            // smartctl produced nothing usable; the device is not
            // answering this cycle.
            return Err(SentryError::DeviceUnavailable {
                device: device.to_string(),
            });
        }

        if self.include_disk_usage {
            if let Some(usage) = disk_usage_percent(device) {
                sample = sample.with_attr(
                    attrs::DISK_USAGE_PERCENT,
                    AttributeValue::raw(usage),
                );
            }
        }

        Ok(sample)
    }
}

/// Parse smartctl JSON output into attributes.
fn merge_smartctl_json(sample: &mut AttributeSample, json: &serde_json::Value) {
    if let Some(passed) = json
        .get("smart_status")
        .and_then(|s| s.get("passed"))
        .and_then(|p| p.as_bool())
    {
        sample.attributes.insert(
            attrs::SMART_PASSED.to_string(),
            AttributeValue::raw(if passed { 1.0 } else { 0.0 }),
        );
    }

    if let Some(temp) = json
        .get("temperature")
        .and_then(|t| t.get("current"))
        .and_then(|c| c.as_f64())
    {
        sample
            .attributes
            .insert(attrs::TEMPERATURE_CELSIUS.to_string(), AttributeValue::raw(temp));
    }

    if let Some(hours) = json
        .get("power_on_time")
        .and_then(|p| p.get("hours"))
        .and_then(|h| h.as_f64())
    {
        sample
            .attributes
            .insert(attrs::POWER_ON_HOURS.to_string(), AttributeValue::raw(hours));
    }

    // NVMe health log
    if let Some(nvme) = json.get("nvme_smart_health_information_log") {
        for (key, attr) in [
            ("media_errors", attrs::MEDIA_ERRORS),
            ("unsafe_shutdowns", attrs::UNSAFE_SHUTDOWNS),
        ] {
            if let Some(v) = nvme.get(key).and_then(|v| v.as_f64()) {
                sample
                    .attributes
                    .insert(attr.to_string(), AttributeValue::raw(v));
            }
        }
    }

    // ATA attribute table
    let table = json
        .get("ata_smart_attributes")
        .and_then(|a| a.get("table"))
        .and_then(|t| t.as_array());
    if let Some(table) = table {
        for entry in table {
            let id = entry.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
            let raw = entry
                .get("raw")
                .and_then(|r| r.get("value"))
                .and_then(|v| v.as_f64());
            let normalized = entry
                .get("value")
                .and_then(|v| v.as_u64())
                .map(|v| v.min(255) as u8);

            let name = match id {
                5 => attrs::REALLOCATED_SECTORS,
                9 => attrs::POWER_ON_HOURS,
                197 => attrs::PENDING_SECTORS,
                198 => attrs::UNCORRECTABLE_ERRORS,
                194 => attrs::TEMPERATURE_CELSIUS,
                _ => continue,
            };

            // temperature.current wins over attribute 194 when both exist
            if name == attrs::TEMPERATURE_CELSIUS
                && sample.attributes.contains_key(attrs::TEMPERATURE_CELSIUS)
            {
                continue;
            }

            if let Some(raw) = raw {
                let value = match normalized {
                    Some(n) => AttributeValue::with_normalized(raw, n),
                    None => AttributeValue::raw(raw),
                };
                sample.attributes.insert(name.to_string(), value);
            }
        }
    }
}

/// Parse the plain-text attribute table (fallback for old smartctl
/// builds without -j). Columns: ID NAME FLAG VALUE WORST THRESH TYPE
/// UPDATED WHEN_FAILED RAW_VALUE.
fn merge_smartctl_text(sample: &mut AttributeSample, output: &str) {
    for line in output.lines() {
        if line.contains("SMART overall-health") || line.contains("SMART Health Status") {
            let passed = line.contains("PASSED") || line.contains("OK");
            sample.attributes.insert(
                attrs::SMART_PASSED.to_string(),
                AttributeValue::raw(if passed { 1.0 } else { 0.0 }),
            );
            continue;
        }

        let name = if line.contains("Reallocated_Sector_Ct") {
            attrs::REALLOCATED_SECTORS
        } else if line.contains("Current_Pending_Sector") {
            attrs::PENDING_SECTORS
        } else if line.contains("Offline_Uncorrectable") {
            attrs::UNCORRECTABLE_ERRORS
        } else if line.contains("Power_On_Hours") {
            attrs::POWER_ON_HOURS
        } else if line.contains("Temperature_Celsius") {
            attrs::TEMPERATURE_CELSIUS
        } else {
            continue;
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 10 {
            if let Ok(raw) = parts[9].parse::<f64>() {
                let normalized = parts[3].parse::<u8>().ok();
                let value = match normalized {
                    Some(n) => AttributeValue::with_normalized(raw, n),
                    None => AttributeValue::raw(raw),
                };
                sample.attributes.insert(name.to_string(), value);
            }
        }
    }
}

/// Filesystem usage for the device, when a mounted filesystem lives on it.
fn disk_usage_percent(device: &str) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    for disk in disks.list() {
        let name = disk.name().to_string_lossy();
        if name.starts_with(device) && disk.total_space() > 0 {
            let used = disk.total_space() - disk.available_space();
            return Some(used as f64 / disk.total_space() as f64 * 100.0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn empty_sample() -> AttributeSample {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        AttributeSample::new("/dev/sda", ts)
    }

    #[test]
    fn test_parse_ata_json() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
            "smart_status": { "passed": true },
            "temperature": { "current": 36 },
            "power_on_time": { "hours": 12077 },
            "ata_smart_attributes": {
                "table": [
                    { "id": 5, "name": "Reallocated_Sector_Ct", "value": 100,
                      "raw": { "value": 0 } },
                    { "id": 197, "name": "Current_Pending_Sector", "value": 98,
                      "raw": { "value": 2 } },
                    { "id": 194, "name": "Temperature_Celsius", "value": 64,
                      "raw": { "value": 36 } },
                    { "id": 12, "name": "Power_Cycle_Count", "value": 99,
                      "raw": { "value": 1500 } }
                ]
            }
        }"#,
        )
        .unwrap();

        let mut sample = empty_sample();
        merge_smartctl_json(&mut sample, &json);

        assert_eq!(sample.raw_value(attrs::SMART_PASSED), Some(1.0));
        assert_eq!(sample.raw_value(attrs::PENDING_SECTORS), Some(2.0));
        assert_eq!(sample.normalized_value(attrs::PENDING_SECTORS), Some(98.0));
        assert_eq!(sample.raw_value(attrs::REALLOCATED_SECTORS), Some(0.0));
        assert_eq!(sample.raw_value(attrs::POWER_ON_HOURS), Some(12077.0));
        // temperature.current wins over attribute 194
        assert_eq!(sample.raw_value(attrs::TEMPERATURE_CELSIUS), Some(36.0));
        // unmapped attributes are dropped
        assert!(sample.raw_value("power_cycle_count").is_none());
    }

    #[test]
    fn test_parse_nvme_json() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
            "smart_status": { "passed": false },
            "nvme_smart_health_information_log": {
                "media_errors": 3,
                "unsafe_shutdowns": 17
            }
        }"#,
        )
        .unwrap();

        let mut sample = empty_sample();
        merge_smartctl_json(&mut sample, &json);

        assert_eq!(sample.raw_value(attrs::SMART_PASSED), Some(0.0));
        assert_eq!(sample.raw_value(attrs::MEDIA_ERRORS), Some(3.0));
        assert_eq!(sample.raw_value(attrs::UNSAFE_SHUTDOWNS), Some(17.0));
    }

    #[test]
    fn test_parse_text_fallback() {
        let output = "\
SMART overall-health self-assessment test result: PASSED

ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  5 Reallocated_Sector_Ct   0x0033   100   100   005    Pre-fail  Always       -       4
197 Current_Pending_Sector  0x0012   100   100   000    Old_age   Always       -       0
  9 Power_On_Hours          0x0032   097   097   000    Old_age   Always       -       2817
194 Temperature_Celsius     0x0022   064   055   045    Old_age   Always       -       36
";
        let mut sample = empty_sample();
        merge_smartctl_text(&mut sample, output);

        assert_eq!(sample.raw_value(attrs::SMART_PASSED), Some(1.0));
        assert_eq!(sample.raw_value(attrs::REALLOCATED_SECTORS), Some(4.0));
        assert_eq!(
            sample.normalized_value(attrs::REALLOCATED_SECTORS),
            Some(100.0)
        );
        assert_eq!(sample.raw_value(attrs::PENDING_SECTORS), Some(0.0));
        assert_eq!(sample.raw_value(attrs::TEMPERATURE_CELSIUS), Some(36.0));
    }
}
