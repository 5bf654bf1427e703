//! Configuration for the envlink device bridge.

use std::path::PathBuf;

use envlink_common::{Format, KEY_PREFIX, KeyExprBuilder, LoggingConfig, ZenohConfig};
use envlink_pipeline::{
    BridgeConfig, Credentials, PipelineConfig, PipelineError, Qos, Result, StreamOptions,
};
use serde::{Deserialize, Serialize};

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvlinkConfig {
    /// Zenoh connection settings.
    pub zenoh: ZenohConfig,

    /// Where and how readings are published.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Which sensors to read.
    #[serde(default)]
    pub sensors: SensorsConfig,

    /// Pipeline tuning (poll, buffer, backoff, connection, publisher, shutdown, health).
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Wire format for telemetry messages.
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Key expression prefix (default: "envlink").
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Topic under `<key_prefix>/<device_id>/`.
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub qos: Qos,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_topic() -> String {
    "env_monitor/data".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            topic: default_topic(),
            qos: Qos::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// Credential references. The password itself never lives in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
}

/// Device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id used in key expressions and messages.
    /// Use "auto" to take the hostname (default).
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_device_id() -> String {
    "auto".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
        }
    }
}

/// How the CPU temperature is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureBackend {
    /// Thermal zone file reporting millidegrees.
    #[default]
    Sysfs,
    /// `vcgencmd measure_temp` (Raspberry Pi firmware).
    Vcgencmd,
}

/// CPU temperature sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: TemperatureBackend,

    /// Thermal zone file for the sysfs backend.
    #[serde(default = "default_sysfs_path")]
    pub path: PathBuf,

    /// Command for the vcgencmd backend.
    #[serde(default = "default_vcgencmd")]
    pub command: String,

    /// Readings outside this range (°C) carry an "Abnormal CPU temperature" warning.
    #[serde(default = "default_min_celsius")]
    pub min_celsius: f64,

    #[serde(default = "default_max_celsius")]
    pub max_celsius: f64,
}

fn default_true() -> bool {
    true
}

fn default_sysfs_path() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_vcgencmd() -> String {
    "vcgencmd".to_string()
}

fn default_min_celsius() -> f64 {
    0.0
}

fn default_max_celsius() -> f64 {
    100.0
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: TemperatureBackend::default(),
            path: default_sysfs_path(),
            command: default_vcgencmd(),
            min_celsius: default_min_celsius(),
            max_celsius: default_max_celsius(),
        }
    }
}

/// Sensor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub temperature: TemperatureConfig,

    /// Collect CPU, memory, root disk and network counters.
    #[serde(default = "default_true")]
    pub system_metrics: bool,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            temperature: TemperatureConfig::default(),
            system_metrics: true,
        }
    }
}

impl BridgeConfig for EnvlinkConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    fn key_prefix(&self) -> &str {
        &self.broker.key_prefix
    }

    fn validate(&self) -> Result<()> {
        self.zenoh.validate()?;
        self.pipeline.validate()?;

        if self.broker.topic.trim().is_empty() {
            return Err(PipelineError::validation("broker.topic must not be empty"));
        }
        self.keys()?.telemetry(&self.broker.topic)?;

        let sensors = &self.sensors;
        if !sensors.temperature.enabled && !sensors.system_metrics {
            return Err(PipelineError::validation(
                "At least one sensor must be enabled",
            ));
        }
        if sensors.temperature.min_celsius >= sensors.temperature.max_celsius {
            return Err(PipelineError::validation(
                "sensors.temperature.min_celsius must be below max_celsius",
            ));
        }

        self.credentials()?;
        Ok(())
    }
}

impl EnvlinkConfig {
    /// Get the device id to use, resolving "auto" if needed.
    pub fn get_device_id(&self) -> String {
        if self.device.device_id == "auto" {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .map(|h| sanitize_device_id(&h))
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            self.device.device_id.clone()
        }
    }

    /// Key expression builder for this device.
    pub fn keys(&self) -> Result<KeyExprBuilder> {
        Ok(KeyExprBuilder::with_prefix(
            self.broker.key_prefix.clone(),
            self.get_device_id(),
        )?)
    }

    pub fn stream(&self) -> StreamOptions {
        StreamOptions {
            topic: self.broker.topic.clone(),
            qos: self.broker.qos,
            format: self.serialization,
        }
    }

    /// Resolve credentials from the process environment.
    pub fn credentials(&self) -> Result<Credentials> {
        self.resolve_credentials(|name| std::env::var(name).ok())
    }

    /// Resolve credentials with a custom variable lookup.
    pub fn resolve_credentials<F>(&self, lookup: F) -> Result<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let creds = &self.broker.credentials;

        let password = match &creds.password_env {
            Some(var) => match lookup(var) {
                Some(password) => Some(password),
                None => {
                    return Err(PipelineError::validation(format!(
                        "broker.credentials.password_env refers to unset variable '{}'",
                        var
                    )));
                }
            },
            None => None,
        };

        if password.is_some() && creds.username.is_none() {
            return Err(PipelineError::validation(
                "broker.credentials.password_env requires a username",
            ));
        }

        Ok(Credentials {
            username: creds.username.clone(),
            password,
        })
    }
}

/// Make a hostname usable as a single key expression chunk.
fn sanitize_device_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '/' | '*' | '$' | '?' | '#' | '@' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
