//! Supervisor lifecycle: startup, shutdown sequence, restarts and run-once.

mod common;

use std::time::Duration;

use common::{MockTransport, ScriptedSource, Step, keys};
use envlink_pipeline::{
    Credentials, Format, PipelineConfig, PipelineError, PipelineStatus, Qos, StreamOptions,
    Supervisor, SupervisorOutcome,
};
use tokio::sync::oneshot;

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.poll.interval_secs = 1;
    config.poll.read_timeout_ms = 500;
    config.connection.connect_timeout_ms = 2000;
    config.connection.keepalive_interval_secs = 5;
    config.shutdown.drain_window_secs = 1;
    config.health.interval_secs = 0;
    config
}

fn stream() -> StreamOptions {
    StreamOptions {
        topic: "env_monitor/data".to_string(),
        qos: Qos::AtLeastOnce,
        format: Format::Json,
    }
}

fn supervisor(
    source: ScriptedSource,
    transport: &MockTransport,
    config: &PipelineConfig,
) -> Supervisor<ScriptedSource, MockTransport> {
    Supervisor::new(
        "envlink-test",
        source,
        transport.clone(),
        Credentials::anonymous(),
        config,
        keys(),
        stream(),
    )
    .unwrap()
}

fn statuses(transport: &MockTransport) -> Vec<String> {
    transport
        .published()
        .into_iter()
        .filter(|(key, _)| key == "envlink/pi01/@/status")
        .map(|(_, payload)| {
            serde_json::from_slice::<PipelineStatus>(&payload)
                .unwrap()
                .status
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_runs_and_stops_cleanly() {
    let transport = MockTransport::new();
    let mut config = config();
    config.health.interval_secs = 1;
    let supervisor = supervisor(ScriptedSource::healthy(), &transport, &config);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        transport.wait_for_telemetry(3).await;
        stop_tx.send(()).unwrap();
    };
    let (outcome, ()) = tokio::join!(
        supervisor.run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert!(matches!(outcome, SupervisorOutcome::Stopped(_)));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report().at_risk, 0);
    assert!(!outcome.report().persisted);

    let ids = transport.telemetry_sequence_ids();
    assert!(ids.len() >= 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids {:?}", ids);

    assert_eq!(statuses(&transport), vec!["running", "offline"]);
    assert!(
        transport
            .published_keys()
            .iter()
            .any(|k| k == "envlink/pi01/@/health")
    );
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outage_buffers_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/buffer.json");
    let mut config = config();
    config.buffer.persist_path = Some(path.clone());

    // First run: the broker never comes up.
    let down = MockTransport::new();
    down.always_fail_connects();
    let outcome = supervisor(ScriptedSource::healthy(), &down, &config)
        .run(tokio::time::sleep(Duration::from_millis(3500)))
        .await;

    let report = outcome.report();
    assert_eq!(report.at_risk, 4);
    assert_eq!(report.drained, 0);
    assert!(report.persisted);
    assert!(path.exists());
    assert!(down.telemetry().is_empty());
    assert!(statuses(&down).is_empty());

    // Second run: buffered samples go out first, numbering continues.
    let up = MockTransport::new();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        up.wait_for_telemetry(5).await;
        stop_tx.send(()).unwrap();
    };
    let (outcome, ()) = tokio::join!(
        supervisor(ScriptedSource::healthy(), &up, &config).run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(&up.telemetry_sequence_ids()[..5], &[1, 2, 3, 4, 5]);
    assert_eq!(outcome.report().at_risk, 0);
}

#[tokio::test(start_paused = true)]
async fn test_component_panic_requests_restart() {
    let transport = MockTransport::new();
    let supervisor = supervisor(ScriptedSource::new([Step::Panic]), &transport, &config());

    let outcome = supervisor.run(std::future::pending::<()>()).await;

    match &outcome {
        SupervisorOutcome::RestartRequired { reason, .. } => {
            assert!(reason.contains("poller"), "reason {}", reason)
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(outcome.exit_code(), envlink_pipeline::EXIT_RESTART);
    assert_eq!(
        statuses(&transport).last().map(String::as_str),
        Some("error")
    );
}

#[tokio::test(start_paused = true)]
async fn test_sensor_failures_do_not_stop_pipeline() {
    let transport = MockTransport::new();
    let source = ScriptedSource::new([Step::Fail, Step::Fail, Step::Hang]);
    let supervisor = supervisor(source, &transport, &config());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        transport.wait_for_telemetry(2).await;
        stop_tx.send(()).unwrap();
    };
    let (outcome, ()) = tokio::join!(
        supervisor.run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(outcome.exit_code(), 0);
    // Failed and timed out reads consumed no sequence ids.
    assert_eq!(&transport.telemetry_sequence_ids()[..2], &[1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_run_once_delivers_single_reading() {
    let transport = MockTransport::new();
    let source = ScriptedSource::healthy();
    let reads = source.clone();

    let report = supervisor(source, &transport, &config())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.sequence_id, 1);
    assert!(report.delivered);
    assert_eq!(reads.reads(), 1);
    assert_eq!(transport.telemetry_sequence_ids(), vec![1]);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_once_read_failure() {
    let transport = MockTransport::new();
    let result = supervisor(ScriptedSource::new([Step::Fail]), &transport, &config())
        .run_once()
        .await;

    assert!(matches!(result, Err(PipelineError::Worker(_))));
    assert!(transport.telemetry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_once_broker_unreachable() {
    let transport = MockTransport::new();
    transport.always_fail_connects();

    let report = supervisor(ScriptedSource::healthy(), &transport, &config())
        .run_once()
        .await
        .unwrap();

    assert!(!report.delivered);
}

#[test]
fn test_rejects_invalid_config() {
    let mut config = config();
    config.buffer.capacity = 0;

    let result = Supervisor::new(
        "envlink-test",
        ScriptedSource::healthy(),
        MockTransport::new(),
        Credentials::anonymous(),
        &config,
        keys(),
        stream(),
    );
    assert!(matches!(result, Err(PipelineError::ConfigValidation(_))));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drain_shares_one_window() {
    let transport = MockTransport::new();
    transport.set_telemetry_delay(Duration::from_secs(10));
    let mut config = config();
    config.connection.send_timeout_ms = 30_000;
    config.shutdown.drain_window_secs = 4;
    let supervisor = supervisor(ScriptedSource::healthy(), &transport, &config);

    let started = tokio::time::Instant::now();
    let outcome = supervisor
        .run(tokio::time::sleep(Duration::from_millis(1500)))
        .await;

    // Shutdown at 1.5s with the first sample stuck in the transport. The
    // publisher stop uses up the 4s window, leaving nothing for the drain.
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(7), "took {:?}", elapsed);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report().drained, 0);
    assert!(outcome.report().at_risk > 0);
    assert_eq!(outcome.report().buffer.in_flight, 0);
}
