use bus_core::MessageError;
use bus_discovery::DiscoveryError;
use bus_transport::{ConnectionKey, RegistryError, TransportError};
use thiserror::Error;

/// Errors from assembling, starting and closing a bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The router needs a Tokio runtime to run its task.
    #[error("No Tokio runtime available; build the bus inside a runtime")]
    NoRuntime,

    /// The bus has been closed.
    #[error("Bus is closed")]
    Closed,

    /// Some connections failed to start and were removed; the rest run.
    #[error("{} connection(s) failed to start", .failed.len())]
    PartialStart {
        failed: Vec<(ConnectionKey, TransportError)>,
    },

    /// A beacon was requested without a server to announce.
    #[error("Cannot announce '{service}': the bus does not listen anywhere")]
    NotListening { service: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RegistryError> for BusError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Closed => Self::Closed,
            RegistryError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Io { path: String, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid URI '{value}' in {field}: {reason}")]
    InvalidUri {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}
