//! # Bus Telemetry
//!
//! Logging setup for bus nodes. Library crates only emit `tracing` events;
//! binaries call [`init_logging`] once at startup.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUS_SERVICE_NAME` | `process-bus` | Service name logged at startup |
//! | `BUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `BUS_JSON_LOGS` | `false` | JSON output instead of pretty text |
//! | `BUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout at all |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}
