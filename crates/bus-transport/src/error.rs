//! Transport error types.

use crate::uri::ConnectionUri;
use bus_core::CodecError;
use thiserror::Error;

/// Errors that can occur in socket transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The URI could not be parsed.
    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The URI scheme is not one the bus speaks.
    #[error("unsupported URI scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },

    /// Binding a listening socket failed.
    #[error("failed to bind {uri}: {source}")]
    Bind {
        uri: ConnectionUri,
        #[source]
        source: std::io::Error,
    },

    /// Opening an outbound connection failed.
    #[error("failed to connect to {uri}: {source}")]
    Connect {
        uri: ConnectionUri,
        #[source]
        source: std::io::Error,
    },

    /// The outbound connection did not complete in time.
    #[error("connection to {uri} timed out")]
    ConnectTimeout { uri: ConnectionUri },

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// An `ssl://` connection was requested without TLS settings.
    #[error("no TLS configuration available for {uri}")]
    TlsNotConfigured { uri: ConnectionUri },

    /// The connection is closed or was never started.
    #[error("connection {uri} is closed")]
    Closed { uri: ConnectionUri },

    /// The socket stopped draining and its frame queue is full.
    #[error("send queue for {uri} is full ({capacity} frames)")]
    SendQueueFull { uri: ConnectionUri, capacity: usize },

    /// The message could not be framed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Other socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True if the connection that produced this error is unusable.
    ///
    /// A message that cannot be framed is the message's fault, not the
    /// connection's.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Codec(e) => e.is_fatal(),
            Self::InvalidUri { .. } | Self::UnsupportedScheme { .. } => false,
            _ => true,
        }
    }
}

/// Errors from registering a connection with a router.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The router has shut down.
    #[error("connection registry is closed")]
    Closed,

    /// The connection was accepted but failed to start.
    #[error("connection failed to start: {0}")]
    Transport(#[from] TransportError),
}
