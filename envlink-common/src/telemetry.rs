use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Schema version carried in every published message.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Typed telemetry value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Counter (monotonically increasing).
    Counter(u64),

    /// Gauge (can go up or down).
    Gauge(f64),

    /// Text value.
    Text(String),

    /// Boolean value.
    Boolean(bool),
}

impl TelemetryValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Counter(v) => Some(*v as f64),
            TelemetryValue::Gauge(v) => Some(*v),
            TelemetryValue::Text(_) | TelemetryValue::Boolean(_) => None,
        }
    }
}

impl From<u64> for TelemetryValue {
    fn from(v: u64) -> Self {
        TelemetryValue::Counter(v)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Gauge(v)
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        TelemetryValue::Text(v)
    }
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self {
        TelemetryValue::Text(v.to_string())
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Boolean(v)
    }
}

/// One sensor reading: named metric values plus validation warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Metric path (e.g. "cpu/temperature") to value.
    pub metrics: BTreeMap<String, TelemetryValue>,

    /// Validation warnings attached when the reading was taken.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metric to this reading.
    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<TelemetryValue>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    /// Attach a validation warning.
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Look up a metric by name.
    pub fn metric(&self, name: &str) -> Option<&TelemetryValue> {
        self.metrics.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Static context describing how the device samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Configured poll interval.
    pub sample_interval_seconds: u64,
    /// Names of the sensors feeding the readings.
    pub available_sensors: Vec<String>,
}

/// A sample as it appears on the wire.
///
/// `redelivery` is set whenever `attempt > 0`, so a consumer can always tell a
/// retried sample from a first delivery and deduplicate on `sequence_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Device identifier.
    pub device_id: String,
    /// Per-process monotonically increasing sample id.
    pub sequence_id: u64,
    /// Unix epoch milliseconds when the reading was captured.
    pub timestamp: i64,
    /// Number of earlier failed delivery attempts.
    pub attempt: u32,
    /// True when this sample may already have been seen.
    pub redelivery: bool,
    /// Message schema version.
    pub version: String,
    /// Reading values.
    pub metrics: BTreeMap<String, TelemetryValue>,
    /// Validation warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Sampling context.
    pub metadata: MessageMetadata,
}

impl TelemetryMessage {
    pub fn new(
        device_id: impl Into<String>,
        sequence_id: u64,
        timestamp: i64,
        attempt: u32,
        reading: &Reading,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sequence_id,
            timestamp,
            attempt,
            redelivery: attempt > 0,
            version: SCHEMA_VERSION.to_string(),
            metrics: reading.metrics.clone(),
            warnings: reading.warnings.clone(),
            metadata,
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_builder() {
        let mut reading = Reading::new()
            .with_metric("cpu/temperature", 48.3)
            .with_metric("network/bytes_sent", 1024u64);
        reading.push_warning("Abnormal CPU temperature");

        assert_eq!(
            reading.metric("cpu/temperature"),
            Some(&TelemetryValue::Gauge(48.3))
        );
        assert_eq!(
            reading.metric("network/bytes_sent"),
            Some(&TelemetryValue::Counter(1024))
        );
        assert_eq!(reading.warnings, vec!["Abnormal CPU temperature"]);
        assert!(!reading.is_empty());
    }

    #[test]
    fn test_redelivery_marked() {
        let reading = Reading::new().with_metric("cpu/temperature", 40.0);

        let first = TelemetryMessage::new("pi", 7, 1_700_000_000_000, 0, &reading, Default::default());
        assert!(!first.redelivery);

        let retry = TelemetryMessage::new("pi", 7, 1_700_000_000_000, 2, &reading, Default::default());
        assert!(retry.redelivery);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_value_numeric_view() {
        assert_eq!(TelemetryValue::from(42u64).as_f64(), Some(42.0));
        assert_eq!(TelemetryValue::from(3.5).as_f64(), Some(3.5));
        assert_eq!(TelemetryValue::from("ok").as_f64(), None);
        assert_eq!(TelemetryValue::from(true).as_f64(), None);
    }

    #[test]
    fn test_empty_warnings_not_serialized() {
        let reading = Reading::new().with_metric("cpu/usage", 12.5);
        let json = serde_json::to_string(&reading).unwrap();
        assert!(!json.contains("warnings"));
    }
}
