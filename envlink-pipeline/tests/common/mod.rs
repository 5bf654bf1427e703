//! In-memory fakes for the pipeline capabilities.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use envlink_common::{KeyExprBuilder, Reading, TelemetryMessage, decode_auto};
use envlink_pipeline::{
    Ack, BackoffPolicy, ConnectionManager, ConnectionSettings, Credentials, Qos, SampleSource,
    SourceError, Transport, TransportError,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MockState {
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    publish_script: Mutex<VecDeque<Result<Ack, TransportError>>>,
    connect_delay: Mutex<Duration>,
    telemetry_delay: Mutex<Duration>,
    probe_fails: AtomicBool,
    connect_calls: AtomicUsize,
    connecting_now: AtomicUsize,
    max_concurrent_connects: AtomicUsize,
    publish_calls: AtomicUsize,
    closes: AtomicUsize,
    next_session: AtomicU64,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Scriptable transport. Unscripted calls succeed.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, count: usize) {
        let mut script = self.state.connect_script.lock();
        for _ in 0..count {
            script.push_back(Err(TransportError::Connect("connection refused".to_string())));
        }
    }

    pub fn always_fail_connects(&self) {
        self.fail_connects(10_000);
    }

    pub fn fail_publishes(&self, count: usize) {
        let mut script = self.state.publish_script.lock();
        for _ in 0..count {
            script.push_back(Err(TransportError::ConnectionLost("broken pipe".to_string())));
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Delay telemetry publishes. `@` metadata keys are not delayed.
    pub fn set_telemetry_delay(&self, delay: Duration) {
        *self.state.telemetry_delay.lock() = delay;
    }

    pub fn set_probe_fails(&self, fails: bool) {
        self.state.probe_fails.store(fails, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_connects(&self) -> usize {
        self.state.max_concurrent_connects.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.state.publish_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every successful publish as (key, payload).
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.published.lock().clone()
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.published().into_iter().map(|(key, _)| key).collect()
    }

    /// Decoded telemetry messages, skipping `@` metadata keys.
    pub fn telemetry(&self) -> Vec<TelemetryMessage> {
        self.published()
            .into_iter()
            .filter(|(key, _)| !key.contains("/@/"))
            .map(|(_, payload)| decode_auto(&payload).expect("telemetry payload decodes"))
            .collect()
    }

    pub fn telemetry_sequence_ids(&self) -> Vec<u64> {
        self.telemetry().iter().map(|m| m.sequence_id).collect()
    }

    /// Wait (in tokio time) until at least `count` telemetry messages arrived.
    pub async fn wait_for_telemetry(&self, count: usize) {
        while self.telemetry().len() < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Transport for MockTransport {
    type Session = u64;

    async fn connect(
        &self,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<Self::Session, TransportError> {
        let state = &self.state;
        state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let now = state.connecting_now.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_concurrent_connects.fetch_max(now, Ordering::SeqCst);

        let delay = *state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = state.connect_script.lock().pop_front();
        state.connecting_now.fetch_sub(1, Ordering::SeqCst);

        scripted
            .unwrap_or(Ok(()))
            .map(|()| state.next_session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn publish(
        &self,
        _session: &Self::Session,
        topic: &str,
        payload: Vec<u8>,
        _qos: Qos,
    ) -> Result<Ack, TransportError> {
        self.state.publish_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.telemetry_delay.lock();
        if !delay.is_zero() && !topic.contains("/@/") {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.state.publish_script.lock().pop_front();
        let result = scripted.unwrap_or(Ok(Ack::Confirmed));
        if result.is_ok() {
            self.state
                .published
                .lock()
                .push((topic.to_string(), payload));
        }
        result
    }

    async fn probe(&self, _session: &Self::Session) -> Result<(), TransportError> {
        if self.state.probe_fails.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionLost("probe failed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&self, _session: &Self::Session) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a [`ScriptedSource`] does on a read.
#[derive(Debug, Clone)]
pub enum Step {
    Read(f64),
    Fail,
    Hang,
    Panic,
}

/// Source that follows a script, then reads a steady value.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Step>>>,
    reads: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn healthy() -> Self {
        Self::new([])
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SampleSource for ScriptedSource {
    fn sensors(&self) -> Vec<String> {
        vec!["cpu_temperature".to_string()]
    }

    async fn read(&mut self) -> Result<Reading, SourceError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();

        match step.unwrap_or(Step::Read(40.0 + n as f64)) {
            Step::Read(temp) => Ok(Reading::new().with_metric("cpu/temperature", temp)),
            Step::Fail => Err(SourceError::Bus("i2c transfer failed".to_string())),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("sensor driver crashed"),
        }
    }
}

pub fn keys() -> KeyExprBuilder {
    KeyExprBuilder::new("pi01").unwrap()
}

pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(1),
        keepalive_interval: Duration::from_secs(5),
        degraded_grace: Duration::from_secs(20),
    }
}

pub fn no_jitter() -> BackoffPolicy {
    BackoffPolicy {
        base_delay_ms: 1000,
        max_delay_ms: 60_000,
        multiplier: 2.0,
        jitter_fraction: 0.0,
    }
}

pub fn manager(transport: &MockTransport) -> Arc<ConnectionManager<MockTransport>> {
    Arc::new(ConnectionManager::new(
        transport.clone(),
        Credentials::anonymous(),
        fast_settings(),
        no_jitter(),
    ))
}
