//! Device sensors: CPU temperature and system metrics.

use std::path::PathBuf;

use envlink_pipeline::{Reading, SampleSource, SourceError};
use sysinfo::{Disks, Networks, System};
use tracing::{debug, warn};

use crate::config::{SensorsConfig, TemperatureBackend};

pub const WARN_ABNORMAL_TEMPERATURE: &str = "Abnormal CPU temperature";
pub const WARN_MISSING_SYSTEM_METRICS: &str = "Missing system metrics";

/// Parse `vcgencmd measure_temp` output, e.g. `temp=48.3'C`.
pub fn parse_vcgencmd_output(output: &str) -> Option<f64> {
    let rest = output.trim().strip_prefix("temp=")?;
    let (value, _) = rest.split_once("'C")?;
    value.trim().parse().ok()
}

/// Parse a thermal zone file (millidegrees Celsius).
pub fn parse_millidegrees(content: &str) -> Option<f64> {
    let millis: i64 = content.trim().parse().ok()?;
    Some(millis as f64 / 1000.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Where the CPU temperature comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemperatureProbe {
    Sysfs(PathBuf),
    Command(String),
}

impl TemperatureProbe {
    pub async fn read(&self) -> Result<f64, SourceError> {
        match self {
            TemperatureProbe::Sysfs(path) => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    SourceError::Bus(format!("failed to read {}: {}", path.display(), e))
                })?;
                parse_millidegrees(&content).ok_or_else(|| {
                    SourceError::Bus(format!(
                        "unparsable temperature in {}: {:?}",
                        path.display(),
                        content.trim()
                    ))
                })
            }
            TemperatureProbe::Command(command) => {
                let output = tokio::process::Command::new(command)
                    .arg("measure_temp")
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| SourceError::Bus(format!("failed to run {}: {}", command, e)))?;

                if !output.status.success() {
                    return Err(SourceError::Bus(format!(
                        "{} exited with {}",
                        command, output.status
                    )));
                }

                let stdout = String::from_utf8_lossy(&output.stdout);
                parse_vcgencmd_output(&stdout).ok_or_else(|| {
                    SourceError::Bus(format!("unparsable {} output: {:?}", command, stdout.trim()))
                })
            }
        }
    }
}

/// System-wide usage figures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemMetrics {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub bytes_sent: Option<u64>,
    pub bytes_recv: Option<u64>,
}

impl SystemMetrics {
    pub fn is_complete(&self) -> bool {
        self.cpu_percent.is_some()
            && self.memory_percent.is_some()
            && self.disk_percent.is_some()
            && self.bytes_sent.is_some()
            && self.bytes_recv.is_some()
    }

    fn write_into(self, reading: &mut Reading) {
        let mut put = |name: &str, value: Option<envlink_pipeline::TelemetryValue>| {
            if let Some(value) = value {
                reading.metrics.insert(name.to_string(), value);
            }
        };

        put("cpu/usage", self.cpu_percent.map(Into::into));
        put("memory/used_percent", self.memory_percent.map(Into::into));
        put("disk/root/used_percent", self.disk_percent.map(Into::into));
        put("network/bytes_sent", self.bytes_sent.map(Into::into));
        put("network/bytes_recv", self.bytes_recv.map(Into::into));
    }
}

/// sysinfo handles kept between reads so CPU usage has a previous sample.
pub struct SystemProbe {
    system: System,
    disks: Disks,
    networks: Networks,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    pub fn collect(&mut self) -> SystemMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.networks.refresh(true);

        let cpu_percent = (!self.system.cpus().is_empty())
            .then(|| round1(self.system.global_cpu_usage() as f64));

        let total_memory = self.system.total_memory();
        let memory_percent = (total_memory > 0)
            .then(|| round1(self.system.used_memory() as f64 / total_memory as f64 * 100.0));

        let disk_percent = self
            .disks
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"))
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let used = disk.total_space().saturating_sub(disk.available_space());
                round1(used as f64 / disk.total_space() as f64 * 100.0)
            });

        let (bytes_sent, bytes_recv) = if self.networks.is_empty() {
            (None, None)
        } else {
            let (sent, recv) = self
                .networks
                .iter()
                .filter(|(name, _)| name.as_str() != "lo")
                .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                    (
                        sent.saturating_add(data.total_transmitted()),
                        recv.saturating_add(data.total_received()),
                    )
                });
            (Some(sent), Some(recv))
        };

        SystemMetrics {
            cpu_percent,
            memory_percent,
            disk_percent,
            bytes_sent,
            bytes_recv,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach the range and completeness warnings to a reading.
pub fn check_reading(
    reading: &mut Reading,
    temperature: Option<f64>,
    range: (f64, f64),
    system: Option<&SystemMetrics>,
) {
    if let Some(temp) = temperature {
        if temp < range.0 || temp > range.1 {
            warn!(temperature = temp, "CPU temperature outside expected range");
            reading.push_warning(WARN_ABNORMAL_TEMPERATURE);
        }
    }

    if let Some(system) = system {
        if !system.is_complete() {
            warn!(metrics = ?system, "System metrics missing or incomplete");
            reading.push_warning(WARN_MISSING_SYSTEM_METRICS);
        }
    }
}

/// The device's sample source.
///
/// A failed temperature read fails the whole reading; missing system metrics
/// only add a warning.
pub struct EnvironmentSource {
    temperature: Option<TemperatureProbe>,
    range: (f64, f64),
    system: Option<SystemProbe>,
}

impl EnvironmentSource {
    pub fn new(config: &SensorsConfig) -> Self {
        let temp = &config.temperature;
        let temperature = temp.enabled.then(|| match temp.backend {
            TemperatureBackend::Sysfs => TemperatureProbe::Sysfs(temp.path.clone()),
            TemperatureBackend::Vcgencmd => TemperatureProbe::Command(temp.command.clone()),
        });

        Self {
            temperature,
            range: (temp.min_celsius, temp.max_celsius),
            system: config.system_metrics.then(SystemProbe::new),
        }
    }
}

impl SampleSource for EnvironmentSource {
    fn sensors(&self) -> Vec<String> {
        let mut sensors = Vec::new();
        if self.temperature.is_some() {
            sensors.push("cpu_temperature".to_string());
        }
        if self.system.is_some() {
            sensors.push("system_metrics".to_string());
        }
        sensors
    }

    async fn read(&mut self) -> Result<Reading, SourceError> {
        let temperature = match &self.temperature {
            Some(probe) => Some(probe.read().await?),
            None => None,
        };

        let system = self.system.as_mut().map(SystemProbe::collect);

        let mut reading = Reading::new();
        if let Some(temp) = temperature {
            reading = reading.with_metric("cpu/temperature", temp);
        }
        if let Some(system) = system {
            system.write_into(&mut reading);
        }
        check_reading(&mut reading, temperature, self.range, system.as_ref());

        debug!(
            metrics = reading.metrics.len(),
            warnings = reading.warnings.len(),
            "Sensors read"
        );
        Ok(reading)
    }
}
