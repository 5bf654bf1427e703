//! Drains the sample buffer over the broker connection.
//!
//! Delivery order is strict: within a batch samples go out in sequence order,
//! and the first failure stops the batch. The failed sample is requeued with
//! its attempt count bumped, the unsent tail is released untouched, and both
//! go out again ahead of anything newer.

use std::sync::Arc;
use std::time::Duration;

use envlink_common::{Format, MessageMetadata, TelemetryMessage, encode};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::SampleBuffer;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{FailureKind, PipelineError, Result};
use crate::health::PipelineHealth;
use crate::sample::Sample;
use crate::shutdown::ShutdownSignal;
use crate::transport::{Qos, Transport};

/// Publisher behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub batch_size: usize,
    /// Drop a sample after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Pause after a failed batch while the connection still looks usable.
    pub retry_delay: Duration,
    pub qos: Qos,
    pub format: Format,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_attempts: None,
            retry_delay: Duration::from_secs(1),
            qos: Qos::AtLeastOnce,
            format: Format::Json,
        }
    }
}

/// Where published samples go and how they are described.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryStream {
    pub device_id: String,
    /// Full key expression the samples are published to.
    pub key: String,
    pub metadata: MessageMetadata,
}

/// Outcome of one [`Publisher::publish_batch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing pending.
    Idle,
    /// Connection not usable; nothing was taken from the buffer.
    NotConnected,
    /// Every sample in the batch was acked.
    Delivered(usize),
    /// A send failed; the batch stopped at `failed_at`.
    Interrupted { delivered: usize, failed_at: u64 },
}

/// Result of a shutdown drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
    pub timed_out: bool,
}

/// Moves samples from the buffer to the broker.
pub struct Publisher<T: Transport> {
    buffer: Arc<SampleBuffer>,
    connection: Arc<ConnectionManager<T>>,
    health: Arc<PipelineHealth>,
    stream: TelemetryStream,
    settings: PublisherSettings,
    /// Sample currently handed to the transport.
    sending: Mutex<Option<u64>>,
}

impl<T: Transport> Publisher<T> {
    pub fn new(
        buffer: Arc<SampleBuffer>,
        connection: Arc<ConnectionManager<T>>,
        health: Arc<PipelineHealth>,
        stream: TelemetryStream,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            buffer,
            connection,
            health,
            stream,
            settings,
            sending: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &TelemetryStream {
        &self.stream
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Build the wire message for a sample.
    pub fn encode_sample(&self, sample: &Sample) -> Result<Vec<u8>> {
        let message = TelemetryMessage::new(
            self.stream.device_id.clone(),
            sample.sequence_id(),
            sample.captured_at(),
            sample.attempt_count(),
            sample.payload(),
            self.stream.metadata.clone(),
        );

        encode(&message, self.settings.format)
            .map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    /// Send one batch.
    pub async fn publish_batch(&self) -> BatchOutcome {
        if self.connection.current_state() != ConnectionState::Connected {
            return BatchOutcome::NotConnected;
        }

        let batch = self.buffer.peek_batch(self.settings.batch_size);
        if batch.is_empty() {
            return BatchOutcome::Idle;
        }

        let mut delivered = 0;
        for (idx, sample) in batch.iter().enumerate() {
            let seq = sample.sequence_id();

            let payload = match self.encode_sample(sample) {
                Ok(payload) => payload,
                Err(e) => {
                    // Retrying cannot fix an encoding failure.
                    warn!(sequence_id = seq, error = %e, "Dropping unencodable sample");
                    self.buffer.abandon(seq);
                    self.health.record_abandoned();
                    continue;
                }
            };

            *self.sending.lock() = Some(seq);
            let result = self
                .connection
                .try_send(&self.stream.key, payload, self.settings.qos)
                .await;
            *self.sending.lock() = None;

            match result {
                Ok(ack) => {
                    self.buffer.ack(seq);
                    self.health.record_published();
                    delivered += 1;
                    debug!(
                        sequence_id = seq,
                        attempt = sample.attempt_count(),
                        ack = ?ack,
                        "Sample delivered"
                    );
                }
                Err(e) => {
                    self.health.record_publish_failure();
                    warn!(
                        sequence_id = seq,
                        attempt = sample.attempt_count(),
                        error = %e,
                        kind = %FailureKind::TransientNetwork,
                        "Publish failed; requeueing"
                    );
                    self.fail_tail(seq, &batch[idx + 1..]);
                    return BatchOutcome::Interrupted {
                        delivered,
                        failed_at: seq,
                    };
                }
            }
        }

        BatchOutcome::Delivered(delivered)
    }

    fn fail_tail(&self, failed: u64, unsent: &[Sample]) {
        self.requeue_failed(failed);

        for sample in unsent {
            self.buffer.release(sample.sequence_id());
        }
    }

    fn requeue_failed(&self, failed: u64) {
        if let Some(attempts) = self.buffer.requeue(failed) {
            if let Some(max) = self.settings.max_attempts {
                if attempts >= max {
                    self.buffer.abandon(failed);
                    self.health.record_abandoned();
                    warn!(
                        sequence_id = failed,
                        attempts,
                        kind = %FailureKind::CapacityLoss,
                        "Sample exceeded max delivery attempts; dropped"
                    );
                }
            }
        }
    }

    /// Put back a batch that was cancelled mid-send.
    ///
    /// The sample that was inside the transport has an unknown outcome and
    /// counts as a failed attempt. Samples never handed over go back unchanged.
    pub fn recover_in_flight(&self) -> usize {
        let interrupted = self.sending.lock().take();
        if let Some(seq) = interrupted {
            debug!(sequence_id = seq, "Send cancelled; requeueing");
            self.requeue_failed(seq);
        }
        self.buffer.release_in_flight() + usize::from(interrupted.is_some())
    }

    /// Drain the buffer until shutdown.
    ///
    /// Waits on the buffer when idle and on the connection when disconnected,
    /// so it never spins.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut state_rx = self.connection.subscribe();
        info!(key = %self.stream.key, "Publisher started");

        while !shutdown.is_triggered() {
            match self.publish_batch().await {
                BatchOutcome::Delivered(_) => {}
                BatchOutcome::Idle => {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = self.buffer.wait_for_pending() => {}
                    }
                }
                BatchOutcome::NotConnected => {
                    let ready = tokio::select! {
                        _ = shutdown.wait() => break,
                        state = state_rx.wait_for(|s| {
                            *s == ConnectionState::Connected || s.is_terminal()
                        }) => state.map(|s| *s == ConnectionState::Connected).unwrap_or(false),
                    };
                    if !ready {
                        break;
                    }
                }
                BatchOutcome::Interrupted { .. } => {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                }
            }
        }

        info!("Publisher stopped");
    }

    /// Deliver what is left in the buffer within `window`.
    pub async fn drain(&self, window: Duration) -> DrainReport {
        let deadline = Instant::now() + window;
        let mut report = DrainReport::default();

        loop {
            let outcome = match tokio::time::timeout_at(deadline, self.publish_batch()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    report.timed_out = true;
                    break;
                }
            };

            match outcome {
                BatchOutcome::Delivered(n) => report.delivered += n,
                BatchOutcome::Idle => break,
                BatchOutcome::NotConnected => {
                    if tokio::time::timeout_at(deadline, self.connection.wait_connected())
                        .await
                        .map_or(true, |connected| !connected)
                    {
                        report.timed_out = self.connection.current_state() != ConnectionState::Closed;
                        break;
                    }
                }
                BatchOutcome::Interrupted { delivered, .. } => {
                    report.delivered += delivered;
                    let retry_at = (Instant::now() + self.settings.retry_delay).min(deadline);
                    tokio::time::sleep_until(retry_at).await;
                    if Instant::now() >= deadline {
                        report.timed_out = true;
                        break;
                    }
                }
            }
        }

        // A batch cut off by the deadline leaves its samples in flight.
        self.recover_in_flight();
        report.remaining = self.buffer.len();
        report
    }
}
