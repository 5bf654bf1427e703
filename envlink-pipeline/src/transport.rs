//! Broker transport capability.
//!
//! The pipeline only needs `connect`, `publish`, `probe` and `close`. The
//! [`ConnectionManager`](crate::ConnectionManager) is the sole caller of
//! `connect` and `close`, and serializes them.

use std::future::Future;
use std::time::Duration;

use envlink_common::SessionAuth;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire and forget. Acked as soon as the message leaves the process.
    AtMostOnce,
    /// Wait for the transport to confirm the message was taken.
    #[default]
    AtLeastOnce,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The broker confirmed receipt.
    Confirmed,
    /// Handed to the transport; no broker confirmation exists.
    Sent,
}

/// Broker credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// User/password pair for session auth, if both are set.
    pub fn session_auth(&self) -> Option<SessionAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(SessionAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Publish/subscribe capability the pipeline delivers through.
pub trait Transport: Send + Sync + 'static {
    /// Live connection handle.
    type Session: Send + Sync + 'static;

    /// Open a session. Must give up after `timeout`.
    fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;

    /// Publish one payload to `topic`.
    fn publish(
        &self,
        session: &Self::Session,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    /// Cheap liveness check used for keepalive.
    fn probe(
        &self,
        session: &Self::Session,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear the session down.
    fn close(&self, session: &Self::Session) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("pi", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("pi"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_session_auth_needs_both() {
        assert!(Credentials::anonymous().session_auth().is_none());
        assert!(
            Credentials {
                username: Some("pi".to_string()),
                password: None,
            }
            .session_auth()
            .is_none()
        );
        assert_eq!(
            Credentials::new("pi", "pw").session_auth().map(|a| a.username),
            Some("pi".to_string())
        );
    }

    #[test]
    fn test_qos_serde() {
        let qos: Qos = serde_json::from_str("\"at_most_once\"").unwrap();
        assert_eq!(qos, Qos::AtMostOnce);
        assert_eq!(Qos::default(), Qos::AtLeastOnce);
    }
}
