//! envlink device bridge.
//!
//! Reads the CPU temperature and system metrics of the local device and
//! publishes them through the envlink pipeline.
//!
//! # Key Expressions
//!
//! ```text
//! envlink/<device_id>/<topic>        telemetry (default topic: env_monitor/data)
//! envlink/<device_id>/@/status       running / offline announcements
//! envlink/<device_id>/@/health       periodic health snapshots
//! ```

pub mod config;
pub mod sensors;

pub use config::EnvlinkConfig;
pub use sensors::EnvironmentSource;
