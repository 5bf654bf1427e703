//! envlink device bridge.
//!
//! Samples the local sensors on a fixed cadence and delivers every reading to
//! Zenoh, buffering through broker outages.

use std::process::ExitCode;

use envlink_common::init_tracing;
use envlink_pipeline::{BridgeArgs, BridgeConfig, Supervisor, ZenohTransport};
use tracing::{error, info, warn};

use envlink_bridge::{EnvironmentSource, EnvlinkConfig};

const BRIDGE_NAME: &str = "envlink";

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_requested() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = BridgeArgs::parse_with_default("envlink.json5");

    // Misconfiguration is fatal before anything starts.
    let config = match EnvlinkConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("envlink: {} ({})", e, e.kind());
            return Ok(ExitCode::FAILURE);
        }
    };

    init_tracing(
        &config
            .logging()
            .with_level_override(args.log_level.as_deref()),
    )?;

    let credentials = config.credentials()?;
    let keys = config.keys()?;
    let source = EnvironmentSource::new(&config.sensors);

    info!(
        device_id = %keys.device_id(),
        topic = %config.broker.topic,
        mode = %config.zenoh.mode,
        interval_secs = config.pipeline.poll.interval_secs,
        capacity = config.pipeline.buffer.capacity,
        "envlink bridge configured"
    );

    let supervisor = Supervisor::new(
        BRIDGE_NAME,
        source,
        ZenohTransport::new(config.zenoh.clone()),
        credentials,
        config.pipeline(),
        keys,
        config.stream(),
    )?
    .with_version(env!("CARGO_PKG_VERSION"));

    if args.once {
        return match supervisor.run_once().await {
            Ok(report) if report.delivered => {
                info!(sequence_id = report.sequence_id, "Reading delivered");
                Ok(ExitCode::SUCCESS)
            }
            Ok(report) => {
                error!(
                    sequence_id = report.sequence_id,
                    "Reading not delivered within the drain window"
                );
                Ok(ExitCode::FAILURE)
            }
            Err(e) => {
                error!(error = %e, kind = %e.kind(), "Run-once failed");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    let outcome = supervisor.run(shutdown_requested()).await;
    let code = outcome.exit_code();
    info!(exit_code = code, at_risk = outcome.report().at_risk, "envlink bridge exiting");

    Ok(ExitCode::from(code as u8))
}
