use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Zenoh connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// Zenoh mode: "client", "peer", or "router".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Endpoints to connect to (routers or peers).
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on (for peer/router mode).
    #[serde(default)]
    pub listen: Vec<String>,

    /// TLS settings for `tls/` endpoints.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS material for the Zenoh link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the CA certificate used to verify the router.
    #[serde(default)]
    pub root_ca_certificate: Option<String>,

    /// Path to the client certificate (mutual TLS).
    #[serde(default)]
    pub connect_certificate: Option<String>,

    /// Path to the client private key (mutual TLS).
    #[serde(default)]
    pub connect_private_key: Option<String>,

    /// Check the router certificate against the endpoint host name.
    #[serde(default = "default_verify_name")]
    pub verify_name_on_connect: bool,
}

fn default_verify_name() -> bool {
    true
}

impl TlsConfig {
    /// Whether a client certificate is presented.
    pub fn is_mutual(&self) -> bool {
        self.connect_certificate.is_some()
    }
}

fn default_mode() -> String {
    "client".to_string()
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
            tls: None,
        }
    }
}

impl ZenohConfig {
    /// Check the mode and endpoint combination.
    ///
    /// A client with nothing to connect to can never reach a router, so it is
    /// rejected up front instead of retrying forever.
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "client" | "peer" | "router" => {}
            other => {
                return Err(Error::Config(format!(
                    "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                    other
                )));
            }
        }

        if self.mode == "client" && self.connect.is_empty() {
            return Err(Error::Config(
                "Zenoh client mode requires at least one connect endpoint".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.connect_certificate.is_some() != tls.connect_private_key.is_some() {
                return Err(Error::Config(
                    "TLS connect_certificate and connect_private_key must be set together"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Whether the session depends on a router being reachable.
    pub fn is_client(&self) -> bool {
        self.mode == "client"
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Return a copy with the level replaced when an override is given.
    pub fn with_level_override(&self, level: Option<&str>) -> Self {
        match level {
            Some(level) => Self {
                level: level.to_string(),
                format: self.format,
            },
            None => self.clone(),
        }
    }
}

/// Parse a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
