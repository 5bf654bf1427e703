//! Integration tests for envlink-common.

use envlink_common::{
    Format, KeyExprBuilder, MessageMetadata, Reading, TelemetryMessage, TelemetryValue, decode,
    decode_auto, encode, parse_key_expr,
};

fn sample_message(attempt: u32) -> TelemetryMessage {
    let mut reading = Reading::new()
        .with_metric("cpu/temperature", 101.5)
        .with_metric("cpu/usage", 12.5)
        .with_metric("network/bytes_recv", u64::MAX);
    reading.push_warning("Abnormal CPU temperature");

    TelemetryMessage::new(
        "raspberry_pi_monitor",
        1_234,
        1_703_500_000_000,
        attempt,
        &reading,
        MessageMetadata {
            sample_interval_seconds: 60,
            available_sensors: vec!["cpu_temperature".to_string(), "system_metrics".to_string()],
        },
    )
}

#[test]
fn test_full_message_workflow() {
    let message = sample_message(0);

    let json_bytes = encode(&message, Format::Json).expect("JSON encode failed");
    let decoded: TelemetryMessage = decode(&json_bytes, Format::Json).expect("JSON decode failed");
    assert_eq!(decoded.device_id, "raspberry_pi_monitor");
    assert_eq!(decoded.sequence_id, 1_234);
    assert!(!decoded.redelivery);
    assert_eq!(decoded.warnings, vec!["Abnormal CPU temperature"]);
    assert_eq!(
        decoded.metrics.get("network/bytes_recv"),
        Some(&TelemetryValue::Counter(u64::MAX))
    );

    let cbor_bytes = encode(&message, Format::Cbor).expect("CBOR encode failed");
    assert!(cbor_bytes.len() < json_bytes.len());

    let auto_decoded: TelemetryMessage = decode_auto(&cbor_bytes).expect("Auto decode failed");
    assert_eq!(auto_decoded, decoded);
}

#[test]
fn test_json_field_names_are_stable() {
    let json = String::from_utf8(encode(&sample_message(3), Format::Json).unwrap()).unwrap();

    for field in [
        "\"device_id\"",
        "\"sequence_id\"",
        "\"timestamp\"",
        "\"attempt\":3",
        "\"redelivery\":true",
        "\"version\":\"1.0.0\"",
        "\"sample_interval_seconds\":60",
        "\"available_sensors\"",
    ] {
        assert!(json.contains(field), "missing {} in {}", field, json);
    }
}

#[test]
fn test_key_expression_building_and_parsing() {
    let builder = KeyExprBuilder::new("raspberry_pi_001").unwrap();
    let key = builder.telemetry("env_monitor/data").unwrap();

    let parsed = parse_key_expr(&key).expect("Parse failed");
    assert_eq!(parsed.device_id, "raspberry_pi_001");
    assert_eq!(parsed.topic, "env_monitor/data");

    assert!(parse_key_expr(&builder.health_key()).is_none());
    assert!(parse_key_expr(&builder.status_key()).is_none());
}

#[test]
fn test_device_ids_with_punctuation() {
    for device in ["pi-01", "pi_02", "pi.local", "192.168.1.20"] {
        let key = KeyExprBuilder::new(device)
            .unwrap()
            .telemetry("data")
            .unwrap();
        assert_eq!(parse_key_expr(&key).unwrap().device_id, device);
    }
}
