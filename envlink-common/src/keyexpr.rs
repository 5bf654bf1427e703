use crate::error::{Error, Result};

/// Default key expression prefix for all envlink traffic.
pub const KEY_PREFIX: &str = "envlink";

/// Characters that carry meaning in Zenoh key expressions.
const RESERVED: &[char] = &['*', '$', '?', '#'];

/// Builder for constructing envlink key expressions.
///
/// Key expressions follow the pattern:
/// `<prefix>/<device_id>/<topic>`, with bridge metadata under
/// `<prefix>/<device_id>/@/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExprBuilder {
    prefix: String,
    device_id: String,
}

impl KeyExprBuilder {
    /// Create a builder for a device under the default prefix.
    pub fn new(device_id: impl Into<String>) -> Result<Self> {
        Self::with_prefix(KEY_PREFIX, device_id)
    }

    /// Create a builder with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>, device_id: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let device_id = device_id.into();

        validate_path(&prefix)?;
        validate_chunk(&device_id)?;

        Ok(Self { prefix, device_id })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Key expression for a telemetry topic.
    ///
    /// # Example
    /// ```
    /// use envlink_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::new("pi01").unwrap();
    /// assert_eq!(builder.telemetry("env_monitor/data").unwrap(), "envlink/pi01/env_monitor/data");
    /// ```
    pub fn telemetry(&self, topic: &str) -> Result<String> {
        validate_path(topic)?;
        Ok(format!("{}/{}/{}", self.prefix, self.device_id, topic))
    }

    /// Key expression for the health snapshot.
    ///
    /// # Example
    /// ```
    /// use envlink_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::new("pi01").unwrap();
    /// assert_eq!(builder.health_key(), "envlink/pi01/@/health");
    /// ```
    pub fn health_key(&self) -> String {
        format!("{}/{}/@/health", self.prefix, self.device_id)
    }

    /// Key expression for bridge status.
    pub fn status_key(&self) -> String {
        format!("{}/{}/@/status", self.prefix, self.device_id)
    }

    /// Wildcard matching everything this device publishes.
    pub fn device_wildcard(&self) -> String {
        format!("{}/{}/**", self.prefix, self.device_id)
    }
}

fn validate_chunk(chunk: &str) -> Result<()> {
    if chunk.is_empty() {
        return Err(Error::KeyExpr("empty key segment".to_string()));
    }
    if chunk.contains('/') {
        return Err(Error::KeyExpr(format!("'{}' must be a single segment", chunk)));
    }
    if chunk == "@" || chunk.contains(RESERVED) {
        return Err(Error::KeyExpr(format!("'{}' contains reserved characters", chunk)));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::KeyExpr("empty key expression".to_string()));
    }
    path.split('/').try_for_each(validate_chunk)
}

/// Parse a telemetry key expression back into device and topic.
///
/// Returns `None` for keys outside the default prefix and for metadata keys.
pub fn parse_key_expr(key: &str) -> Option<ParsedKeyExpr<'_>> {
    let mut parts = key.splitn(3, '/');

    if parts.next()? != KEY_PREFIX {
        return None;
    }

    let device_id = parts.next().filter(|d| !d.is_empty())?;
    let topic = parts.next().filter(|t| !t.is_empty() && !t.starts_with("@"))?;

    Some(ParsedKeyExpr { device_id, topic })
}

/// Parsed components of a telemetry key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyExpr<'a> {
    pub device_id: &'a str,
    pub topic: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builder() {
        let builder = KeyExprBuilder::new("raspberry_pi_001").unwrap();

        assert_eq!(
            builder.telemetry("env_monitor/data").unwrap(),
            "envlink/raspberry_pi_001/env_monitor/data"
        );
        assert_eq!(builder.health_key(), "envlink/raspberry_pi_001/@/health");
        assert_eq!(builder.status_key(), "envlink/raspberry_pi_001/@/status");
        assert_eq!(builder.device_wildcard(), "envlink/raspberry_pi_001/**");
    }

    #[test]
    fn test_rejects_reserved_segments() {
        assert!(KeyExprBuilder::new("pi/01").is_err());
        assert!(KeyExprBuilder::new("pi*").is_err());
        assert!(KeyExprBuilder::new("").is_err());
        assert!(KeyExprBuilder::with_prefix("site//a", "pi").is_err());

        let builder = KeyExprBuilder::new("pi").unwrap();
        assert!(builder.telemetry("data/**").is_err());
        assert!(builder.telemetry("").is_err());
        assert!(builder.telemetry("@/status").is_err());
    }

    #[test]
    fn test_parse_key_expr() {
        let parsed = parse_key_expr("envlink/pi01/env_monitor/data").unwrap();

        assert_eq!(parsed.device_id, "pi01");
        assert_eq!(parsed.topic, "env_monitor/data");
    }

    #[test]
    fn test_parse_invalid_key() {
        assert!(parse_key_expr("invalid/key").is_none());
        assert!(parse_key_expr("envlink/pi01").is_none());
        assert!(parse_key_expr("envlink/pi01/@/health").is_none());
        assert!(parse_key_expr("other/pi01/data").is_none());
    }
}
