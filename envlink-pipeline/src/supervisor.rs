//! Pipeline lifecycle: wiring, health reporting and the shutdown sequence.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use envlink_common::{Format, KeyExprBuilder, MessageMetadata};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::buffer::{BufferStats, SampleBuffer};
use crate::config::PipelineConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{FailureKind, PipelineError, Result};
use crate::health::{HealthSnapshot, PipelineHealth};
use crate::persist::{self, BufferSnapshot};
use crate::poller::{HealthSignal, Poller, PollerSettings};
use crate::publisher::{Publisher, PublisherSettings, TelemetryStream};
use crate::sample::SequenceGenerator;
use crate::shutdown::Shutdown;
use crate::source::SampleSource;
use crate::status::PipelineStatus;
use crate::transport::{Credentials, Qos, Transport};

/// How long a worker gets to stop on its own before it is aborted.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit status asking the process supervisor for a restart (EX_TEMPFAIL).
pub const EXIT_RESTART: i32 = 75;

/// What to publish and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub topic: String,
    pub qos: Qos,
    pub format: Format,
}

/// Summary produced by the shutdown sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Samples delivered during the drain window.
    pub drained: usize,
    /// Samples still buffered at exit.
    pub at_risk: usize,
    /// Whether the remaining samples were written to disk.
    pub persisted: bool,
    pub buffer: BufferStats,
}

/// Final decision of [`Supervisor::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Shutdown was requested and completed.
    Stopped(ShutdownReport),
    /// A component died; the process should be restarted.
    RestartRequired {
        reason: String,
        report: ShutdownReport,
    },
}

impl SupervisorOutcome {
    pub fn report(&self) -> &ShutdownReport {
        match self {
            SupervisorOutcome::Stopped(report) => report,
            SupervisorOutcome::RestartRequired { report, .. } => report,
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorOutcome::Stopped(_) => 0,
            SupervisorOutcome::RestartRequired { .. } => EXIT_RESTART,
        }
    }
}

/// Result of [`Supervisor::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnceReport {
    pub sequence_id: u64,
    pub delivered: bool,
}

/// A spawned component task.
struct Worker {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Resolve when the task ends, with a description of how.
    async fn exited(&mut self) -> String {
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };

        let result = handle.await;
        self.handle = None;

        match result {
            Ok(()) => format!("{} exited unexpectedly", self.name),
            Err(e) if e.is_panic() => format!("{} panicked", self.name),
            Err(e) => format!("{} failed: {}", self.name, e),
        }
    }

    /// Wait up to `within` for the task to end, then abort it.
    async fn stop(&mut self, within: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        if tokio::time::timeout(within, &mut handle).await.is_err() {
            warn!(worker = self.name, "Worker did not stop in time; aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Everything but the source, so the source can move into the poller.
struct Core<T: Transport> {
    name: String,
    version: String,
    keys: KeyExprBuilder,
    buffer: Arc<SampleBuffer>,
    health: Arc<PipelineHealth>,
    connection: Arc<ConnectionManager<T>>,
    publisher: Arc<Publisher<T>>,
    poller_settings: PollerSettings,
    drain_window: Duration,
    health_interval: Option<Duration>,
    persist_path: Option<PathBuf>,
}

/// Wires the pipeline components together and owns their lifetime.
///
/// # Example
///
/// ```ignore
/// let supervisor = Supervisor::new(
///     "envlink", source, ZenohTransport::new(zenoh), credentials,
///     &config.pipeline, keys, stream,
/// )?;
/// let outcome = supervisor.run(shutdown_signal()).await;
/// std::process::exit(outcome.exit_code());
/// ```
pub struct Supervisor<S: SampleSource, T: Transport> {
    source: S,
    core: Core<T>,
}

impl<S: SampleSource, T: Transport> Supervisor<S, T> {
    /// Build every component. Nothing runs until [`run`](Self::run).
    pub fn new(
        name: impl Into<String>,
        source: S,
        transport: T,
        credentials: Credentials,
        config: &PipelineConfig,
        keys: KeyExprBuilder,
        stream: StreamOptions,
    ) -> Result<Self> {
        config.validate()?;

        let name = name.into();
        let key = keys.telemetry(&stream.topic)?;
        let buffer = Arc::new(SampleBuffer::new(config.buffer.capacity));
        let health = Arc::new(PipelineHealth::new(name.clone()));
        let connection = Arc::new(ConnectionManager::new(
            transport,
            credentials,
            config.connection_settings(),
            config.backoff.clone(),
        ));

        let telemetry = TelemetryStream {
            device_id: keys.device_id().to_string(),
            key,
            metadata: MessageMetadata {
                sample_interval_seconds: config.poll.interval_secs,
                available_sensors: source.sensors(),
            },
        };
        let publisher = Arc::new(Publisher::new(
            buffer.clone(),
            connection.clone(),
            health.clone(),
            telemetry,
            PublisherSettings {
                batch_size: config.publisher.batch_size,
                max_attempts: config.publisher.max_attempts,
                retry_delay: Duration::from_millis(config.publisher.retry_delay_ms),
                qos: stream.qos,
                format: stream.format,
            },
        ));

        Ok(Self {
            source,
            core: Core {
                name,
                version: env!("CARGO_PKG_VERSION").to_string(),
                keys,
                buffer,
                health,
                connection,
                publisher,
                poller_settings: config.poller_settings(),
                drain_window: config.drain_window(),
                health_interval: config.health_interval(),
                persist_path: config.buffer.persist_path.clone(),
            },
        })
    }

    /// Version reported in status messages.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.core.version = version.into();
        self
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.core.buffer
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.core.health
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.core.connection
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.core.health_snapshot()
    }

    /// Run until `shutdown_requested` resolves or a component dies.
    ///
    /// Shutdown order: stop sampling, stop the publisher loop, drain within the
    /// drain window, announce offline (or the error behind a restart), close
    /// the connection, report and optionally persist what is left.
    pub async fn run<F>(self, shutdown_requested: F) -> SupervisorOutcome
    where
        F: Future<Output = ()>,
    {
        let Self { source, core } = self;
        let sequence = Arc::new(SequenceGenerator::starting_at(core.restore_buffer()));

        info!(
            bridge = %core.name,
            version = %core.version,
            key = %core.publisher.stream().key,
            capacity = core.buffer.capacity(),
            "Starting pipeline"
        );

        let mut connection_worker = Worker::spawn("connection manager", {
            let connection = core.connection.clone();
            async move { connection.run().await }
        });

        let publisher_stop = Shutdown::new();
        let mut publisher_worker = Worker::spawn("publisher", {
            let publisher = core.publisher.clone();
            let signal = publisher_stop.signal();
            async move { publisher.run(signal).await }
        });

        let (signal_tx, mut signal_rx) = mpsc::channel(16);
        let poller_stop = Shutdown::new();
        let poller = Poller::new(
            source,
            core.buffer.clone(),
            sequence.clone(),
            core.health.clone(),
            signal_tx,
            core.poller_settings,
        );
        let mut poller_worker = Worker::spawn("poller", poller.run(poller_stop.signal()));

        let mut health_ticker = core.health_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut state_rx = core.connection.subscribe();
        let mut announced = false;

        tokio::pin!(shutdown_requested);

        let restart_reason = loop {
            tokio::select! {
                _ = &mut shutdown_requested => {
                    info!(bridge = %core.name, "Received shutdown signal");
                    break None;
                }
                reason = connection_worker.exited() => break Some(reason),
                reason = publisher_worker.exited() => break Some(reason),
                reason = poller_worker.exited() => break Some(reason),
                Some(signal) = signal_rx.recv() => core.on_health_signal(signal),
                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    if state == ConnectionState::Connected && !announced {
                        announced = core
                            .publish_status(PipelineStatus::running(&core.name, &core.version))
                            .await;
                    }
                }
                _ = tick(&mut health_ticker) => core.report_health().await,
            }
        };

        if let Some(reason) = &restart_reason {
            error!(reason = %reason, "Component failure; shutting down for restart");
        }

        poller_stop.trigger();
        poller_worker.stop(WORKER_STOP_TIMEOUT).await;

        // Stopping the publisher and draining share one window.
        let drain_deadline = Instant::now() + core.drain_window;
        publisher_stop.trigger();
        publisher_worker.stop(core.drain_window).await;
        core.publisher.recover_in_flight();

        let drain = core
            .publisher
            .drain(drain_deadline.saturating_duration_since(Instant::now()))
            .await;
        info!(
            delivered = drain.delivered,
            remaining = drain.remaining,
            timed_out = drain.timed_out,
            "Drain finished"
        );

        if core.connection.current_state().can_send() {
            let status = match &restart_reason {
                Some(reason) => PipelineStatus::error(&core.name, &core.version, reason.as_str()),
                None => PipelineStatus::offline(&core.name, &core.version),
            };
            core.publish_status(status).await;
        }

        core.connection.close().await;
        connection_worker.stop(WORKER_STOP_TIMEOUT).await;

        let buffer = core.buffer.stats();
        if buffer.len > 0 {
            warn!(
                at_risk = buffer.len,
                kind = %FailureKind::CapacityLoss,
                "Samples still buffered at shutdown"
            );
        }
        let persisted = core.persist_buffer(&sequence);

        let report = ShutdownReport {
            drained: drain.delivered,
            at_risk: buffer.len,
            persisted,
            buffer,
        };

        info!(bridge = %core.name, at_risk = report.at_risk, "Pipeline stopped");

        match restart_reason {
            Some(reason) => SupervisorOutcome::RestartRequired { reason, report },
            None => SupervisorOutcome::Stopped(report),
        }
    }

    /// Take one reading, deliver it, and stop.
    ///
    /// The reading goes through the same buffer and publisher path as normal
    /// operation. Delivery is given the connect timeout plus the drain window.
    pub async fn run_once(self) -> Result<OnceReport> {
        let Self { source, core } = self;

        let mut connection_worker = Worker::spawn("connection manager", {
            let connection = core.connection.clone();
            async move { connection.run().await }
        });

        let (signal_tx, _signal_rx) = mpsc::channel(1);
        let mut poller = Poller::new(
            source,
            core.buffer.clone(),
            Arc::new(SequenceGenerator::new()),
            core.health.clone(),
            signal_tx,
            core.poller_settings,
        );

        let report = match poller.poll_once().await {
            Ok((sequence_id, _)) => {
                let window = core.connection.settings().connect_timeout + core.drain_window;
                let drain = core.publisher.drain(window).await;
                Ok(OnceReport {
                    sequence_id,
                    delivered: drain.remaining == 0,
                })
            }
            Err(e) => Err(PipelineError::worker(format!("sensor read failed: {}", e))),
        };

        core.connection.close().await;
        connection_worker.stop(WORKER_STOP_TIMEOUT).await;

        report
    }
}

impl<T: Transport> Core<T> {
    fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot(
            self.buffer.stats(),
            self.connection.current_state(),
            self.connection.stats(),
        )
    }

    fn restore_buffer(&self) -> u64 {
        let Some(path) = &self.persist_path else {
            return 1;
        };

        match persist::take(path) {
            Ok(Some(snapshot)) => {
                let resume = snapshot.resume_sequence();
                let restored = self.buffer.restore(snapshot.samples);
                info!(
                    path = %path.display(),
                    restored,
                    next_sequence = resume,
                    "Restored buffered samples"
                );
                resume
            }
            Ok(None) => 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable buffer snapshot");
                1
            }
        }
    }

    fn persist_buffer(&self, sequence: &SequenceGenerator) -> bool {
        let Some(path) = &self.persist_path else {
            return false;
        };

        let snapshot = BufferSnapshot {
            next_sequence: sequence.peek(),
            samples: self.buffer.snapshot(),
        };

        match persist::save(path, &snapshot) {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    samples = snapshot.samples.len(),
                    "Buffered samples saved"
                );
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to save buffered samples");
                false
            }
        }
    }

    fn on_health_signal(&self, signal: HealthSignal) {
        match signal {
            HealthSignal::SensorDegraded {
                consecutive_failures,
                last_error,
            } => error!(
                consecutive_failures,
                last_error = %last_error,
                kind = %FailureKind::PersistentHardware,
                "Sensor degraded; still polling"
            ),
            HealthSignal::SensorRecovered { after_failures } => {
                info!(after_failures, "Sensor recovered")
            }
        }
    }

    async fn report_health(&self) {
        let snapshot = self.health_snapshot();
        info!(
            status = %snapshot.status,
            connection = %snapshot.connection,
            sensor = %snapshot.sensor,
            buffered = snapshot.buffer.len,
            published = snapshot.samples_published,
            capacity_loss = snapshot.capacity_loss(),
            "Health"
        );

        if snapshot.connection != ConnectionState::Connected {
            return;
        }

        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode health snapshot");
                return;
            }
        };

        if let Err(e) = self
            .connection
            .try_send(&self.keys.health_key(), payload, Qos::AtMostOnce)
            .await
        {
            warn!(error = %e, "Failed to publish health snapshot");
        }
    }

    async fn publish_status(&self, status: PipelineStatus) -> bool {
        let status = status
            .with("device_id", self.keys.device_id())
            .with("key", self.publisher.stream().key.as_str())
            .with("poll_interval_secs", self.poller_settings.interval.as_secs());

        match status.publish(&self.connection, &self.keys.status_key()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(status = %status.status, error = %e, "Failed to publish status");
                false
            }
        }
    }
}
