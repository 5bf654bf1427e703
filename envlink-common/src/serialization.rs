use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, what most broker consumers expect).
    #[default]
    Json,

    /// CBOR format (compact binary, kinder to constrained links).
    Cbor,
}

impl Format {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

/// Guess the format of a payload: JSON objects and arrays start with `{` or `[`.
pub fn detect_format(data: &[u8]) -> Format {
    match data.first() {
        Some(b'{') | Some(b'[') => Format::Json,
        _ => Format::Cbor,
    }
}

/// Decode bytes, auto-detecting the format.
pub fn decode_auto<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    decode(data, detect_format(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MessageMetadata, Reading, TelemetryMessage};

    fn message() -> TelemetryMessage {
        let reading = Reading::new()
            .with_metric("cpu/temperature", 51.2)
            .with_metric("memory/usage", 33.0);
        TelemetryMessage::new(
            "raspberry_pi_monitor",
            42,
            1_700_000_000_000,
            1,
            &reading,
            MessageMetadata {
                sample_interval_seconds: 60,
                available_sensors: vec!["cpu_temperature".to_string()],
            },
        )
    }

    #[test]
    fn test_cbor_is_smaller() {
        let msg = message();
        let json = encode(&msg, Format::Json).unwrap();
        let cbor = encode(&msg, Format::Cbor).unwrap();

        assert!(cbor.len() < json.len(), "CBOR should be smaller than JSON");
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(detect_format(b"{\"sequence_id\": 1}"), Format::Json);
        assert_eq!(detect_format(b"[1, 2, 3]"), Format::Json);
        assert_eq!(detect_format(b"\xa1\x63key\x65value"), Format::Cbor);
        assert_eq!(detect_format(b""), Format::Cbor);
    }

    #[test]
    fn test_auto_decode_both_formats() {
        let msg = message();

        let from_json: TelemetryMessage = decode_auto(&encode(&msg, Format::Json).unwrap()).unwrap();
        let from_cbor: TelemetryMessage = decode_auto(&encode(&msg, Format::Cbor).unwrap()).unwrap();

        assert_eq!(from_json, msg);
        assert_eq!(from_cbor.sequence_id, 42);
        assert!(from_cbor.redelivery);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<TelemetryMessage> = decode(b"not json", Format::Json);
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(Format::Json.mime_type(), "application/json");
        assert_eq!(Format::Cbor.mime_type(), "application/cbor");
    }
}
