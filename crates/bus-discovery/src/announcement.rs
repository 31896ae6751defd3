//! # Announcements
//!
//! One discovery datagram carries one cleartext frame:
//!
//! ```text
//! _type=DISCOVERY  _src=<service>  address=<connectable URI>  _protocol=<data codec>
//! ```

use crate::error::DiscoveryError;
use bus_core::{
    BusMessage, CodecError, CodecKind, ReservedAttribute, WireCodec, DISCOVERY_MESSAGE_TYPE,
};
use bus_transport::ConnectionUri;
use std::collections::HashMap;

/// User attribute carrying the announced address.
pub const ADDRESS_ATTRIBUTE: &str = "address";

/// A service advertising where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Service name, carried in `_src`.
    pub service: String,
    /// Where to connect.
    pub address: ConnectionUri,
    /// Codec the service speaks on `address`.
    pub protocol: CodecKind,
}

impl Announcement {
    /// Create an announcement.
    #[must_use]
    pub fn new(service: impl Into<String>, address: ConnectionUri, protocol: CodecKind) -> Self {
        Self {
            service: service.into(),
            address,
            protocol,
        }
    }

    /// The announcement as a bus message, without `_protocol`.
    #[must_use]
    pub fn to_message(&self) -> BusMessage {
        let attributes = HashMap::from([
            (
                ReservedAttribute::MessageType.name().to_string(),
                DISCOVERY_MESSAGE_TYPE.to_string(),
            ),
            (
                ReservedAttribute::Source.name().to_string(),
                self.service.clone(),
            ),
            (ADDRESS_ATTRIBUTE.to_string(), self.address.to_string()),
        ]);
        BusMessage::from_attributes(attributes)
    }

    /// Encode as one datagram: cleartext, `_protocol` naming the data codec.
    ///
    /// # Errors
    ///
    /// [`CodecError::IllegalByte`] if the service name contains framing bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        WireCodec::standard().encode_as(&self.to_message(), self.protocol)
    }

    /// Parse a datagram. Frames that are not announcements yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError`] if the datagram is corrupt or the announcement is
    /// incomplete.
    pub fn decode(datagram: &[u8]) -> Result<Option<Self>, DiscoveryError> {
        let frame = WireCodec::standard().decode(datagram)?;
        let message = &frame.message;
        if message.message_type() != Some(DISCOVERY_MESSAGE_TYPE) {
            return Ok(None);
        }

        let service = message
            .source()
            .ok_or(DiscoveryError::MissingAttribute("_src"))?;
        let address = message
            .get(ADDRESS_ATTRIBUTE)
            .ok_or(DiscoveryError::MissingAttribute(ADDRESS_ATTRIBUTE))?
            .parse::<ConnectionUri>()
            .map_err(DiscoveryError::InvalidAddress)?;
        let protocol = frame
            .codec_kind()?
            .ok_or(DiscoveryError::MissingAttribute("_protocol"))?;

        Ok(Some(Self::new(service, address, protocol)))
    }
}
