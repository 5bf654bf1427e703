//! envlink Pipeline
//!
//! Store-and-forward delivery of sensor readings to a broker, built to keep
//! running through flaky hardware and flaky networks.
//!
//! # Overview
//!
//! - [`SampleBuffer`] bounded FIFO of samples with pending/in-flight tracking
//! - [`ConnectionManager`] broker connection state machine with backoff
//! - [`Publisher`] ordered, acknowledged delivery out of the buffer
//! - [`Poller`] periodic sampling, independent of the connection
//! - [`Supervisor`] wiring, health reporting and the shutdown sequence
//! - [`SampleSource`] and [`Transport`] capabilities, with [`ZenohTransport`]
//! - [`BridgeConfig`] and [`BridgeArgs`] for configuration and CLI parsing
//!
//! # Example
//!
//! ```ignore
//! use envlink_pipeline::{BridgeArgs, BridgeConfig, Supervisor, ZenohTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("envlink.json5");
//!     let config = MyConfig::load(&args.config)?;
//!
//!     let supervisor = Supervisor::new(
//!         "envlink",
//!         MySource::new(),
//!         ZenohTransport::new(config.zenoh().clone()),
//!         credentials,
//!         config.pipeline(),
//!         keys,
//!         stream,
//!     )?;
//!
//!     let outcome = supervisor.run(async { tokio::signal::ctrl_c().await.ok(); }).await;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

mod args;
mod backoff;
mod buffer;
mod config;
mod connection;
mod error;
mod health;
mod persist;
mod poller;
mod publisher;
mod sample;
mod shutdown;
mod source;
mod status;
mod supervisor;
mod transport;
mod zenoh_transport;

pub use args::BridgeArgs;
pub use backoff::{Backoff, BackoffPolicy};
pub use buffer::{BufferStats, EnqueueResult, SampleBuffer};
pub use config::{
    BridgeConfig, BufferConfig, ConnectionConfig, HealthConfig, PipelineConfig, PollConfig,
    PublisherConfig, ShutdownConfig,
};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStats,
};
pub use error::{FailureKind, PipelineError, Result, SourceError, TransportError};
pub use health::{HealthSnapshot, PipelineHealth, SensorStatus};
pub use persist::BufferSnapshot;
pub use poller::{HealthSignal, Poller, PollerSettings, ReadFailureTracker};
pub use publisher::{BatchOutcome, DrainReport, Publisher, PublisherSettings, TelemetryStream};
pub use sample::{Sample, SequenceGenerator};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use source::SampleSource;
pub use status::PipelineStatus;
pub use supervisor::{
    EXIT_RESTART, OnceReport, ShutdownReport, StreamOptions, Supervisor, SupervisorOutcome,
};
pub use transport::{Ack, Credentials, Qos, Transport};
pub use zenoh_transport::ZenohTransport;

// Re-export commonly used types from envlink-common
pub use envlink_common::{
    Format, KeyExprBuilder, LoggingConfig, MessageMetadata, Reading, TelemetryMessage,
    TelemetryValue, ZenohConfig,
};
