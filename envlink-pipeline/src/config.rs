//! Configuration traits and pipeline settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use envlink_common::{LoggingConfig, ZenohConfig};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::backoff::BackoffPolicy;
use crate::connection::ConnectionSettings;
use crate::error::{PipelineError, Result};
use crate::poller::PollerSettings;

/// Trait for bridge configuration types.
///
/// Implement this for the bridge's configuration struct to get loading and
/// validation with the usual error mapping.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use envlink_pipeline::{BridgeConfig, PipelineConfig};
/// use envlink_common::{LoggingConfig, ZenohConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub pipeline: PipelineConfig,
/// }
///
/// impl BridgeConfig for MyConfig {
///     fn zenoh(&self) -> &ZenohConfig { &self.zenoh }
///     fn logging(&self) -> &LoggingConfig { &self.logging }
///     fn pipeline(&self) -> &PipelineConfig { &self.pipeline }
///     fn key_prefix(&self) -> &str { "envlink" }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the pipeline tuning.
    fn pipeline(&self) -> &PipelineConfig;

    /// Get the key expression prefix.
    fn key_prefix(&self) -> &str;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. The default checks the shared sections.
    fn validate(&self) -> Result<()> {
        self.zenoh().validate()?;
        self.pipeline().validate()
    }

    /// Load configuration from a JSON5 file and validate it.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PipelineError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }
}

/// Sampling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Consecutive failed reads before the sensor is reported unresponsive.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Local buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Snapshot file kept across restarts. Disabled when unset.
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

fn default_capacity() -> usize {
    1000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            persist_path: None,
        }
    }
}

/// Connection timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_degraded_grace_secs")]
    pub degraded_grace_secs: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_keepalive_interval_secs() -> u64 {
    15
}

fn default_degraded_grace_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            degraded_grace_secs: default_degraded_grace_secs(),
        }
    }
}

/// Publisher batching and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Give up on a sample after this many failed attempts. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_batch_size() -> usize {
    32
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: None,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Shutdown behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time allowed to flush the buffer on shutdown.
    #[serde(default = "default_drain_window_secs")]
    pub drain_window_secs: u64,
}

fn default_drain_window_secs() -> u64 {
    5
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_window_secs: default_drain_window_secs(),
        }
    }
}

/// Health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Snapshot interval. 0 disables periodic health reports.
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

fn default_health_interval_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
        }
    }
}

/// All pipeline tuning in one section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(PipelineError::validation("pipeline.poll.interval_secs must be > 0"));
        }
        if self.poll.read_timeout_ms == 0 {
            return Err(PipelineError::validation(
                "pipeline.poll.read_timeout_ms must be > 0",
            ));
        }
        if self.poll.failure_threshold == 0 {
            return Err(PipelineError::validation(
                "pipeline.poll.failure_threshold must be > 0",
            ));
        }
        if self.buffer.capacity == 0 {
            return Err(PipelineError::validation("pipeline.buffer.capacity must be > 0"));
        }
        if self.publisher.batch_size == 0 {
            return Err(PipelineError::validation(
                "pipeline.publisher.batch_size must be > 0",
            ));
        }
        if self.publisher.max_attempts == Some(0) {
            return Err(PipelineError::validation(
                "pipeline.publisher.max_attempts must be > 0 when set",
            ));
        }
        if self.connection.connect_timeout_ms == 0 || self.connection.send_timeout_ms == 0 {
            return Err(PipelineError::validation(
                "pipeline.connection timeouts must be > 0",
            ));
        }
        if self.connection.keepalive_interval_secs == 0 {
            return Err(PipelineError::validation(
                "pipeline.connection.keepalive_interval_secs must be > 0",
            ));
        }
        self.backoff.validate()
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            interval: Duration::from_secs(self.poll.interval_secs),
            read_timeout: Duration::from_millis(self.poll.read_timeout_ms),
            failure_threshold: self.poll.failure_threshold,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.connection.send_timeout_ms),
            keepalive_interval: Duration::from_secs(self.connection.keepalive_interval_secs),
            degraded_grace: Duration::from_secs(self.connection.degraded_grace_secs),
        }
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.shutdown.drain_window_secs)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health.interval_secs > 0).then(|| Duration::from_secs(self.health.interval_secs))
    }
}
