//! # Bus Node
//!
//! Demo process for the bus: joins the configured connections, logs every
//! message it sees, and optionally publishes a heartbeat.
//!
//! ```text
//! bus-node [config.toml]
//! ```
//!
//! Without a file the node starts from defaults; `BUS_LISTEN`, `BUS_CONNECT`
//! and `BUS_CODEC` override either.
//!
//! ## Startup Sequence
//!
//! 1. Initialize logging
//! 2. Load configuration (file, then environment)
//! 3. Build the bus and subscribe the message logger
//! 4. Start routing; connections that fail to start are logged and dropped
//! 5. Publish heartbeats until Ctrl+C, then close

use std::time::Duration;

use anyhow::{Context, Result};
use bus_core::{BusMessage, HandlerResult, Subscription};
use bus_runtime::{Bus, BusBuilder, BusConfig, BusError};
use bus_telemetry::{init_logging, TelemetryConfig};
use tracing::{error, info, warn};

/// Message type of the heartbeat.
const HEARTBEAT_TYPE: &str = "HEARTBEAT";

fn load_config() -> Result<BusConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => BusConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => BusConfig::default(),
    };
    config
        .with_env_overrides()
        .context("Invalid environment override")
}

fn log_message(msg: &BusMessage) -> HandlerResult {
    let mut attributes: Vec<String> = msg.iter().map(|(k, v)| format!("{k}={v}")).collect();
    attributes.sort();
    info!(
        from_peer = msg.is_from_peer(),
        attributes = %attributes.join(" "),
        "Message"
    );
    Ok(())
}

async fn heartbeat(bus: &Bus, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut sequence: u64 = 0;
    loop {
        ticker.tick().await;
        sequence += 1;
        let msg = bus
            .message_builder()
            .set_message_id(sequence.to_string())
            .set_message_type(HEARTBEAT_TYPE)
            .build();
        bus.publish(msg);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&TelemetryConfig::for_service("bus-node"))
        .context("Failed to initialize logging")?;

    let config = load_config()?;
    info!(
        service = %config.service,
        codec = %config.codec,
        listen = config.listen.len(),
        connect = config.connect.len(),
        "Starting bus node"
    );

    let bus = BusBuilder::from_config(&config)
        .build()
        .context("Failed to assemble bus")?;
    let _logger = bus.subscribe(Subscription::all(), log_message);

    match bus.start().await {
        Ok(()) => {}
        Err(BusError::PartialStart { failed }) => {
            for (connection, e) in failed {
                warn!(connection = %connection, error = %e, "Connection unavailable");
            }
        }
        Err(e) => return Err(e).context("Failed to start bus"),
    }
    for server in bus.servers() {
        info!(uri = %server.advertised_uri(), "Accepting peers");
    }

    info!("Node is running. Press Ctrl+C to stop.");
    match config.heartbeat {
        Some(period) => {
            tokio::select! {
                () = heartbeat(&bus, period) => {}
                signal = tokio::signal::ctrl_c() => signal.context("Failed to wait for Ctrl+C")?,
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl+C")?,
    }

    info!("Shutting down");
    if let Err(e) = bus.close().await {
        error!(error = %e, "Shutdown failed");
    }
    Ok(())
}
