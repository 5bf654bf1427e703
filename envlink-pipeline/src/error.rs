//! Error types for the telemetry pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can stop the pipeline from starting or shutting down cleanly.
///
/// Failures inside a running component (a bad sensor read, a failed send) are
/// absorbed by that component and never surface as a `PipelineError`.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport error outside the retry loop (run-once mode).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Buffer persistence error.
    #[error("Buffer persistence error: {0}")]
    Persistence(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a worker error.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_)
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse(_)
            | Self::ConfigValidation(_) => FailureKind::FatalConfig,
            Self::Transport(_) => FailureKind::TransientNetwork,
            Self::Serialization(_) | Self::Persistence(_) | Self::Worker(_) | Self::Io(_) => {
                FailureKind::Internal
            }
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for PipelineError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<envlink_common::Error> for PipelineError {
    fn from(err: envlink_common::Error) -> Self {
        match err {
            envlink_common::Error::Config(msg) => Self::Config(msg),
            envlink_common::Error::KeyExpr(msg) => Self::ConfigValidation(msg),
            envlink_common::Error::Io(e) => Self::Io(e),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Failure of a [`SampleSource`](crate::SampleSource) read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The bus transaction itself failed.
    #[error("Bus transfer failed: {0}")]
    Bus(String),

    /// The read did not complete in time.
    #[error("Sensor read timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of a [`Transport`](crate::Transport) operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection handshake failed.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Broker rejected or failed a publish.
    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    /// The underlying session went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// No usable session (Disconnected or Connecting).
    #[error("Not connected")]
    NotConnected,

    /// The connection manager has been shut down.
    #[error("Connection closed")]
    Closed,
}

/// Failure taxonomy used in logs and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Single bad sensor read.
    TransientHardware,
    /// Consecutive sensor failures past the threshold.
    PersistentHardware,
    /// Single send or connect failure.
    TransientNetwork,
    /// Buffer eviction or rejection.
    CapacityLoss,
    /// Missing or invalid startup parameter.
    FatalConfig,
    /// Bug-class failure (encoding, persistence, dead worker).
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientHardware => "transient_hardware",
            FailureKind::PersistentHardware => "persistent_hardware",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::CapacityLoss => "capacity_loss",
            FailureKind::FatalConfig => "fatal_config",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
