use bus_core::CodecError;
use bus_transport::{ConnectionUri, TransportError};
use thiserror::Error;

/// Errors from discovery configuration and announcement parsing.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The group URI is not `multicast://<multicast ip>:<port>`.
    #[error("'{uri}' is not a multicast group")]
    NotMulticast { uri: ConnectionUri },

    /// The announcement lacks a required attribute.
    #[error("announcement missing '{0}'")]
    MissingAttribute(&'static str),

    /// The announced address is not a connectable URI.
    #[error("announced address invalid: {0}")]
    InvalidAddress(#[source] TransportError),

    /// The datagram is not a valid frame, or names an unknown codec.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
