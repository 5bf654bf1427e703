//! Periodic sampling, independent of connection state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::buffer::{EnqueueResult, SampleBuffer};
use crate::error::{FailureKind, SourceError};
use crate::health::PipelineHealth;
use crate::sample::{Sample, SequenceGenerator};
use crate::shutdown::ShutdownSignal;
use crate::source::SampleSource;

/// Health events raised by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// Consecutive read failures reached the threshold.
    SensorDegraded {
        consecutive_failures: u32,
        last_error: String,
    },
    /// A read succeeded after a degraded signal.
    SensorRecovered { after_failures: u32 },
}

/// Counts consecutive read failures and decides when to raise a signal.
///
/// `SensorDegraded` fires once when the count reaches the threshold, and not
/// again until a success has produced `SensorRecovered`.
#[derive(Debug, Clone)]
pub struct ReadFailureTracker {
    threshold: u32,
    consecutive: u32,
    signalled: bool,
}

impl ReadFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            signalled: false,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn record_failure(&mut self, error: &SourceError) -> Option<HealthSignal> {
        self.consecutive = self.consecutive.saturating_add(1);

        if self.consecutive >= self.threshold && !self.signalled {
            self.signalled = true;
            return Some(HealthSignal::SensorDegraded {
                consecutive_failures: self.consecutive,
                last_error: error.to_string(),
            });
        }
        None
    }

    pub fn record_success(&mut self) -> Option<HealthSignal> {
        let after_failures = std::mem::take(&mut self.consecutive);

        if std::mem::take(&mut self.signalled) {
            return Some(HealthSignal::SensorRecovered { after_failures });
        }
        None
    }
}

/// Poller timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub read_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(5),
            failure_threshold: 5,
        }
    }
}

/// Reads the source on a fixed cadence and enqueues samples.
pub struct Poller<S: SampleSource> {
    source: S,
    buffer: Arc<SampleBuffer>,
    sequence: Arc<SequenceGenerator>,
    health: Arc<PipelineHealth>,
    signals: mpsc::Sender<HealthSignal>,
    settings: PollerSettings,
    tracker: ReadFailureTracker,
}

impl<S: SampleSource> Poller<S> {
    pub fn new(
        source: S,
        buffer: Arc<SampleBuffer>,
        sequence: Arc<SequenceGenerator>,
        health: Arc<PipelineHealth>,
        signals: mpsc::Sender<HealthSignal>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            buffer,
            sequence,
            health,
            signals,
            tracker: ReadFailureTracker::new(settings.failure_threshold),
            settings,
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Take one reading and buffer it.
    ///
    /// Returns the sequence id assigned to the sample. A failed read consumes
    /// no sequence id.
    pub async fn poll_once(&mut self) -> Result<(u64, EnqueueResult), SourceError> {
        let read_timeout = self.settings.read_timeout;
        let result = match tokio::time::timeout(read_timeout, self.source.read()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(read_timeout)),
        };

        let reading = match result {
            Ok(reading) => reading,
            Err(e) => {
                self.on_failure(&e);
                return Err(e);
            }
        };

        self.health.record_read_success();
        if let Some(signal) = self.tracker.record_success() {
            info!("Sensor recovered");
            self.emit(signal);
        }

        let sequence_id = self.sequence.next();
        let sample = Sample::new(
            sequence_id,
            chrono::Utc::now().timestamp_millis(),
            reading,
        );

        let outcome = self.buffer.enqueue(sample);
        match outcome {
            EnqueueResult::Accepted => debug!(sequence_id, "Reading buffered"),
            EnqueueResult::AcceptedWithEviction(evicted) => warn!(
                sequence_id,
                evicted,
                kind = %FailureKind::CapacityLoss,
                "Sample lost to buffer eviction"
            ),
            EnqueueResult::Rejected => warn!(
                sequence_id,
                kind = %FailureKind::CapacityLoss,
                "Sample rejected by full buffer"
            ),
        }

        Ok((sequence_id, outcome))
    }

    fn on_failure(&mut self, e: &SourceError) {
        let signal = self.tracker.record_failure(e);
        let consecutive = self.tracker.consecutive_failures();
        self.health
            .record_read_failure(&e.to_string(), consecutive, self.tracker.threshold());

        warn!(
            error = %e,
            consecutive_failures = consecutive,
            kind = %FailureKind::TransientHardware,
            "Sensor read failed; skipping"
        );

        if let Some(signal) = signal {
            error!(
                error = %e,
                consecutive_failures = consecutive,
                kind = %FailureKind::PersistentHardware,
                "Sensor unresponsive"
            );
            self.emit(signal);
        }
    }

    fn emit(&self, signal: HealthSignal) {
        if let Err(e) = self.signals.try_send(signal) {
            debug!(error = %e, "Health signal dropped");
        }
    }

    /// Poll every `interval` until shutdown. The first read happens immediately.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = self.poll_once() => {}
            }
        }

        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_signalled_once() {
        let mut tracker = ReadFailureTracker::new(5);
        let err = SourceError::Bus("i2c nack".to_string());

        let signals: Vec<_> = (0..10).filter_map(|_| tracker.record_failure(&err)).collect();

        assert_eq!(signals.len(), 1);
        assert_eq!(
            signals[0],
            HealthSignal::SensorDegraded {
                consecutive_failures: 5,
                last_error: err.to_string(),
            }
        );
        assert_eq!(tracker.consecutive_failures(), 10);
    }

    #[test]
    fn test_recovery_rearms_signal() {
        let mut tracker = ReadFailureTracker::new(2);
        let err = SourceError::Timeout(Duration::from_secs(1));

        tracker.record_failure(&err);
        assert!(tracker.record_failure(&err).is_some());
        assert_eq!(
            tracker.record_success(),
            Some(HealthSignal::SensorRecovered { after_failures: 2 })
        );

        tracker.record_failure(&err);
        assert!(tracker.record_failure(&err).is_some());
    }

    #[test]
    fn test_success_below_threshold_is_quiet() {
        let mut tracker = ReadFailureTracker::new(3);
        let err = SourceError::Bus("crc".to_string());

        tracker.record_failure(&err);
        assert_eq!(tracker.record_success(), None);
        assert_eq!(tracker.consecutive_failures(), 0);
    }
}
