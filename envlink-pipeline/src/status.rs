//! Bridge status reporting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::transport::{Qos, Transport};

/// Status announced at `<prefix>/<device>/@/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub bridge: String,
    pub version: String,
    /// "running", "offline" or "error".
    pub status: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl PipelineStatus {
    fn new(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: Map::new(),
        }
    }

    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(bridge, version, "running")
    }

    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(bridge, version, "offline")
    }

    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(bridge, version, "error").with("error", error.into())
    }

    /// Attach one metadata field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Publish as JSON. Best effort: the caller decides whether failure matters.
    pub async fn publish<T: Transport>(
        &self,
        connection: &ConnectionManager<T>,
        key: &str,
    ) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        connection.try_send(key, payload, Qos::AtMostOnce).await?;
        Ok(())
    }
}
