//! Pipeline health tracking.
//!
//! [`PipelineHealth`] keeps the counters every component bumps, plus the
//! sensor's liveness. [`HealthSnapshot`] is the serializable view published
//! to `<prefix>/<device>/@/health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferStats;
use crate::connection::{ConnectionState, ConnectionStats};

/// Sensor availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    /// Last read succeeded.
    Online,
    /// Recent reads failed, below the threshold.
    Degraded,
    /// Consecutive failures reached the threshold.
    Offline,
    /// Never read.
    #[default]
    Unknown,
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorStatus::Online => write!(f, "online"),
            SensorStatus::Degraded => write!(f, "degraded"),
            SensorStatus::Offline => write!(f, "offline"),
            SensorStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Default)]
struct SensorState {
    status: SensorStatus,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_seen: i64,
}

/// Shared health counters.
#[derive(Debug)]
pub struct PipelineHealth {
    name: String,
    start_time: Instant,
    samples_read: AtomicU64,
    read_failures: AtomicU64,
    samples_published: AtomicU64,
    publish_failures: AtomicU64,
    samples_abandoned: AtomicU64,
    sensor: RwLock<SensorState>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub bridge: String,
    /// "healthy", "degraded" or "error".
    pub status: String,
    pub uptime_secs: u64,
    pub timestamp: i64,
    pub connection: ConnectionState,
    pub sensor: SensorStatus,
    pub consecutive_read_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sensor_error: Option<String>,
    pub samples_read: u64,
    pub read_failures: u64,
    pub samples_published: u64,
    pub publish_failures: u64,
    pub samples_abandoned: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub buffer: BufferStats,
}

impl HealthSnapshot {
    /// Samples that would be lost if the process died now.
    pub fn at_risk(&self) -> usize {
        self.buffer.len
    }

    /// Samples lost to eviction, rejection or max-attempt abandonment.
    pub fn capacity_loss(&self) -> u64 {
        self.buffer.evicted + self.buffer.rejected + self.buffer.abandoned
    }
}

impl PipelineHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_time: Instant::now(),
            samples_read: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            samples_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            samples_abandoned: AtomicU64::new(0),
            sensor: RwLock::new(SensorState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a successful sensor read.
    pub fn record_read_success(&self) {
        self.samples_read.fetch_add(1, Ordering::SeqCst);

        let mut sensor = self.sensor.write();
        sensor.status = SensorStatus::Online;
        sensor.consecutive_failures = 0;
        sensor.last_error = None;
        sensor.last_seen = chrono::Utc::now().timestamp_millis();
    }

    /// Record a failed sensor read.
    ///
    /// The sensor goes Offline once `consecutive_failures` reaches `threshold`.
    pub fn record_read_failure(&self, error: &str, consecutive_failures: u32, threshold: u32) {
        self.read_failures.fetch_add(1, Ordering::SeqCst);

        let mut sensor = self.sensor.write();
        sensor.consecutive_failures = consecutive_failures;
        sensor.last_error = Some(error.to_string());
        sensor.status = if consecutive_failures >= threshold {
            SensorStatus::Offline
        } else {
            SensorStatus::Degraded
        };
    }

    pub fn record_published(&self) {
        self.samples_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_abandoned(&self) {
        self.samples_abandoned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sensor_status(&self) -> SensorStatus {
        self.sensor.read().status
    }

    pub fn samples_published(&self) -> u64 {
        self.samples_published.load(Ordering::SeqCst)
    }

    /// Snapshot combining these counters with buffer and connection state.
    pub fn snapshot(
        &self,
        buffer: BufferStats,
        connection: ConnectionState,
        connection_stats: ConnectionStats,
    ) -> HealthSnapshot {
        let (sensor, consecutive_read_failures, last_sensor_error) = {
            let sensor = self.sensor.read();
            (
                sensor.status,
                sensor.consecutive_failures,
                sensor.last_error.clone(),
            )
        };

        let connected = connection == ConnectionState::Connected;
        let sensor_ok = matches!(sensor, SensorStatus::Online | SensorStatus::Unknown);

        let status = if connected && sensor_ok {
            "healthy"
        } else if !connected && sensor == SensorStatus::Offline {
            "error"
        } else {
            "degraded"
        };

        HealthSnapshot {
            bridge: self.name.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            connection,
            sensor,
            consecutive_read_failures,
            last_sensor_error,
            samples_read: self.samples_read.load(Ordering::SeqCst),
            read_failures: self.read_failures.load(Ordering::SeqCst),
            samples_published: self.samples_published.load(Ordering::SeqCst),
            publish_failures: self.publish_failures.load(Ordering::SeqCst),
            samples_abandoned: self.samples_abandoned.load(Ordering::SeqCst),
            connect_attempts: connection_stats.connect_attempts,
            connect_failures: connection_stats.connect_failures,
            buffer,
        }
    }
}
