//! Broker connection lifecycle.
//!
//! ```text
//! Disconnected --start--> Connecting --ok--> Connected --failure--> Degraded
//!      ^                      |                  ^                     |
//!      +-------fail-----------+                  +------recovered------+
//!      +-----------------------grace expired---------------------------+
//! any --shutdown--> Closed
//! ```
//!
//! [`ConnectionManager`] is the only component that connects or disconnects.
//! At most one connect attempt is ever in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::{FailureKind, TransportError};
use crate::transport::{Ack, Credentials, Qos, Transport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Believed alive but showed a recent failure.
    Degraded,
    /// Terminal; entered on shutdown.
    Closed,
}

impl ConnectionState {
    /// Whether `try_send` is attempted in this state.
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Next state for `event`, or `None` if the event does not apply here.
    pub fn transition(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Closed, _) => None,
            (_, E::Shutdown) => Some(S::Closed),
            (S::Disconnected, E::Start) => Some(S::Connecting),
            (S::Connecting, E::HandshakeSucceeded) => Some(S::Connected),
            (S::Connecting, E::HandshakeFailed) => Some(S::Disconnected),
            (S::Connected, E::FailureDetected) => Some(S::Degraded),
            (S::Degraded, E::Recovered) => Some(S::Connected),
            (S::Degraded, E::GraceExpired) => Some(S::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    HandshakeSucceeded,
    HandshakeFailed,
    /// A keepalive probe or send failed.
    FailureDetected,
    /// A send or probe succeeded while degraded.
    Recovered,
    GraceExpired,
    Shutdown,
}

/// Timing parameters for the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub keepalive_interval: Duration,
    /// How long Degraded may last before the session is dropped.
    pub degraded_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            degraded_grace: Duration::from_secs(30),
        }
    }
}

/// Connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub connects: u64,
    pub send_failures: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    connects: AtomicU64,
    send_failures: AtomicU64,
}

/// Clears the in-flight flag when a connect attempt ends, even if cancelled.
struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the broker session and its lifecycle.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    credentials: Credentials,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<T::Session>>>,
    backoff: Mutex<Backoff>,
    attempt_in_flight: AtomicBool,
    counters: Counters,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager in the Disconnected state.
    pub fn new(
        transport: T,
        credentials: Credentials,
        settings: ConnectionSettings,
        backoff: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            settings,
            state,
            session: RwLock::new(None),
            backoff: Mutex::new(Backoff::new(backoff)),
            attempt_in_flight: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current state. Never blocks on I/O.
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until Connected. Returns `false` if the manager closed instead.
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.subscribe();
        match rx
            .wait_for(|s| *s == ConnectionState::Connected || s.is_terminal())
            .await
        {
            Ok(state) => *state == ConnectionState::Connected,
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connect_attempts: self.counters.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            connects: self.counters.connects.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            consecutive_failures: self.backoff.lock().consecutive_failures(),
        }
    }

    /// Apply an event. Returns the new state if it changed.
    fn apply(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        let mut changed = None;
        self.state.send_if_modified(|state| match state.transition(event) {
            Some(next) if next != *state => {
                changed = Some((*state, next));
                *state = next;
                true
            }
            _ => false,
        });

        let (from, to) = changed?;
        info!(from = %from, to = %to, event = ?event, "Connection state changed");

        if to == ConnectionState::Connected {
            self.backoff.lock().reset();
        }

        Some(to)
    }

    /// Send one payload over the current session.
    ///
    /// Fails fast with [`TransportError::NotConnected`] unless Connected or
    /// Degraded. A failure moves Connected to Degraded; a success moves
    /// Degraded back to Connected.
    pub async fn try_send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<Ack, TransportError> {
        let state = self.current_state();
        if !state.can_send() {
            return Err(match state {
                ConnectionState::Closed => TransportError::Closed,
                _ => TransportError::NotConnected,
            });
        }

        let Some(session) = self.session.read().clone() else {
            return Err(TransportError::NotConnected);
        };

        let timeout = self.settings.send_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.transport.publish(&session, topic, payload, qos),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match &result {
            Ok(_) => {
                self.apply(ConnectionEvent::Recovered);
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    error = %e,
                    kind = %FailureKind::TransientNetwork,
                    "Send failed"
                );
                self.apply(ConnectionEvent::FailureDetected);
            }
        }

        result
    }

    /// Make one connection attempt from Disconnected.
    ///
    /// Returns an error without touching the transport if another attempt is
    /// already in flight or the manager is not Disconnected.
    pub async fn connect_once(&self) -> Result<(), TransportError> {
        if self
            .attempt_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::Connect(
                "connection attempt already in flight".to_string(),
            ));
        }
        let _guard = AttemptGuard(&self.attempt_in_flight);

        if self.apply(ConnectionEvent::Start).is_none() {
            return Err(match self.current_state() {
                ConnectionState::Closed => TransportError::Closed,
                state => TransportError::Connect(format!("cannot connect while {}", state)),
            });
        }

        self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let timeout = self.settings.connect_timeout;
        debug!(timeout_ms = timeout.as_millis() as u64, "Connecting to broker");

        let result = match tokio::time::timeout(
            timeout,
            self.transport.connect(&self.credentials, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Ok(session) => {
                *self.session.write() = Some(Arc::new(session));

                if self.apply(ConnectionEvent::HandshakeSucceeded).is_none() {
                    // Closed while the handshake was running.
                    self.drop_session().await;
                    return Err(TransportError::Closed);
                }

                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.apply(ConnectionEvent::HandshakeFailed);
                Err(e)
            }
        }
    }

    async fn drop_session(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            self.transport.close(&session).await;
        }
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.read().clone() else {
            return Err(TransportError::NotConnected);
        };

        let timeout = self.settings.send_timeout;
        match tokio::time::timeout(timeout, self.transport.probe(&session)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Sleep for a backoff delay, returning early if the manager closes.
    async fn pause(&self, delay: Duration, state_rx: &mut watch::Receiver<ConnectionState>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = state_rx.wait_for(|s| s.is_terminal()) => {}
        }
    }

    async fn schedule_retry(
        &self,
        error: &TransportError,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) {
        let (delay, failures) = {
            let mut backoff = self.backoff.lock();
            let delay = backoff.record_failure();
            (delay, backoff.consecutive_failures())
        };

        warn!(
            error = %error,
            consecutive_failures = failures,
            retry_in_ms = delay.as_millis() as u64,
            kind = %FailureKind::TransientNetwork,
            "Broker connection failed; backing off"
        );

        self.pause(delay, state_rx).await;
    }

    async fn ride_out_degraded(&self, state_rx: &mut watch::Receiver<ConnectionState>) {
        let deadline = Instant::now() + self.settings.degraded_grace;
        warn!(
            grace_ms = self.settings.degraded_grace.as_millis() as u64,
            "Connection degraded; probing until grace period ends"
        );

        loop {
            let next_probe = (Instant::now() + self.settings.keepalive_interval).min(deadline);

            tokio::select! {
                _ = tokio::time::sleep_until(next_probe) => {
                    if self.current_state() != ConnectionState::Degraded {
                        return;
                    }

                    if Instant::now() >= deadline {
                        if self.apply(ConnectionEvent::GraceExpired).is_some() {
                            self.drop_session().await;
                            let error = TransportError::ConnectionLost(
                                "no recovery within grace period".to_string(),
                            );
                            self.schedule_retry(&error, state_rx).await;
                        }
                        return;
                    }

                    match self.probe().await {
                        Ok(()) => {
                            self.apply(ConnectionEvent::Recovered);
                            return;
                        }
                        Err(e) => debug!(error = %e, "Probe failed while degraded"),
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != ConnectionState::Degraded {
                        return;
                    }
                }
            }
        }
    }

    /// Drive the connection lifecycle until [`close`](Self::close) is called.
    pub async fn run(&self) {
        let mut state_rx = self.subscribe();
        info!("Connection manager started");

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Closed => break,
                ConnectionState::Disconnected => {
                    let result = tokio::select! {
                        result = self.connect_once() => Some(result),
                        _ = state_rx.wait_for(|s| s.is_terminal()) => None,
                    };

                    match result {
                        Some(Ok(())) => info!("Connected to broker"),
                        Some(Err(TransportError::Closed)) | None => {}
                        Some(Err(e)) => self.schedule_retry(&e, &mut state_rx).await,
                    }
                }
                ConnectionState::Connecting => {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                ConnectionState::Connected => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.keepalive_interval) => {
                            if let Err(e) = self.probe().await {
                                warn!(error = %e, "Keepalive probe failed");
                                self.apply(ConnectionEvent::FailureDetected);
                            }
                        }
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                ConnectionState::Degraded => self.ride_out_degraded(&mut state_rx).await,
            }
        }

        self.drop_session().await;
        info!("Connection manager stopped");
    }

    /// Enter Closed and tear down the session. Idempotent.
    pub async fn close(&self) {
        self.apply(ConnectionEvent::Shutdown);
        self.drop_session().await;
    }
}
