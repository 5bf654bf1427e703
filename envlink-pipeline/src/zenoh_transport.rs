//! [`Transport`] over a Zenoh session.

use std::time::Duration;

use envlink_common::{ZenohConfig, open_session};
use zenoh::qos::CongestionControl;

use crate::error::TransportError;
use crate::transport::{Ack, Credentials, Qos, Transport};

/// Zenoh-backed transport.
///
/// Zenoh has no per-message broker acknowledgment. A completed `put` is
/// reported as [`Ack::Sent`]; with [`Qos::AtLeastOnce`] the put uses blocking
/// congestion control so it only completes once the message is queued on a
/// live link.
#[derive(Debug, Clone)]
pub struct ZenohTransport {
    config: ZenohConfig,
}

impl ZenohTransport {
    pub fn new(config: ZenohConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ZenohConfig {
        &self.config
    }
}

fn congestion_control(qos: Qos) -> CongestionControl {
    match qos {
        Qos::AtLeastOnce => CongestionControl::Block,
        Qos::AtMostOnce => CongestionControl::Drop,
    }
}

impl Transport for ZenohTransport {
    type Session = zenoh::Session;

    async fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self::Session, TransportError> {
        let auth = credentials.session_auth();

        match tokio::time::timeout(timeout, open_session(&self.config, auth.as_ref())).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn publish(
        &self,
        session: &Self::Session,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<Ack, TransportError> {
        if session.is_closed() {
            return Err(TransportError::ConnectionLost("session closed".to_string()));
        }

        session
            .put(topic, payload)
            .congestion_control(congestion_control(qos))
            .await
            .map_err(|e| TransportError::Publish {
                key: topic.to_string(),
                message: e.to_string(),
            })?;

        Ok(Ack::Sent)
    }

    async fn probe(&self, session: &Self::Session) -> Result<(), TransportError> {
        if session.is_closed() {
            return Err(TransportError::ConnectionLost("session closed".to_string()));
        }

        // A client session with no router has nowhere to deliver to.
        if self.config.is_client() {
            let routers = session.info().routers_zid().await.count();
            if routers == 0 {
                return Err(TransportError::ConnectionLost(
                    "no router reachable".to_string(),
                ));
            }
        }

        Ok(())
    }

    async fn close(&self, session: &Self::Session) {
        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close Zenoh session cleanly");
        }
    }
}
