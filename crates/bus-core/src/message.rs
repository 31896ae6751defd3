//! # Bus Messages
//!
//! A message is a flat, immutable map of string attributes. A handful of
//! attribute names are reserved by the bus itself and carry a leading `_`;
//! callers set those through the dedicated builder methods only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Prefix shared by every reserved attribute name.
pub const RESERVED_PREFIX: char = '_';

/// Errors raised while assembling a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Attribute names starting with `_` belong to the bus.
    #[error("attribute name '{name}' uses the reserved '_' prefix")]
    ReservedAttributeName { name: String },
}

/// Attribute names reserved by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedAttribute {
    /// `_id`
    MessageId,
    /// `_src`
    Source,
    /// `_dst`
    Destination,
    /// `_type`
    MessageType,
    /// `_protocol`, stamped by the codec on the wire only.
    Protocol,
}

impl ReservedAttribute {
    /// The attribute name as it appears in a message and on the wire.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MessageId => "_id",
            Self::Source => "_src",
            Self::Destination => "_dst",
            Self::MessageType => "_type",
            Self::Protocol => "_protocol",
        }
    }

    /// Read this attribute from a message.
    #[must_use]
    pub fn get(self, msg: &BusMessage) -> Option<&str> {
        msg.get(self.name())
    }
}

impl fmt::Display for ReservedAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a message entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// Published by code running in this process.
    #[default]
    Local,
    /// Ingested from a remote peer. Never forwarded back out.
    Peer,
}

/// An immutable attribute map.
///
/// Cloning is cheap; the attributes are shared behind an `Arc`. Equality
/// compares attributes only, the [`Origin`] tag is routing metadata.
#[derive(Clone)]
pub struct BusMessage {
    attributes: Arc<HashMap<String, String>>,
    origin: Origin,
}

impl BusMessage {
    /// Wrap an attribute map without validation.
    ///
    /// Used by decoders; application code goes through [`BusMessageBuilder`].
    #[must_use]
    pub fn from_attributes(attributes: HashMap<String, String>) -> Self {
        Self {
            attributes: Arc::new(attributes),
            origin: Origin::Local,
        }
    }

    /// Look up an attribute. Absent keys yield `None`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// `_id`
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        ReservedAttribute::MessageId.get(self)
    }

    /// `_type`
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        ReservedAttribute::MessageType.get(self)
    }

    /// `_src`
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        ReservedAttribute::Source.get(self)
    }

    /// `_dst`
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        ReservedAttribute::Destination.get(self)
    }

    /// Borrow the full attribute map.
    #[must_use]
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Take a private copy of the attribute map.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        self.attributes.as_ref().clone()
    }

    /// Iterate over `(name, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True when the message carries no attributes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Where this message entered the process.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// True if the message was ingested from a remote peer.
    #[must_use]
    pub fn is_from_peer(&self) -> bool {
        self.origin == Origin::Peer
    }

    /// Tag the message as ingested from a remote peer.
    ///
    /// The attribute map is shared, not copied.
    #[must_use]
    pub(crate) fn into_ingested(mut self) -> Self {
        self.origin = Origin::Peer;
        self
    }
}

impl PartialEq for BusMessage {
    fn eq(&self, other: &Self) -> bool {
        self.attributes == other.attributes
    }
}

impl Eq for BusMessage {}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("attributes", &self.attributes)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Mutable accumulator for [`BusMessage`]s.
///
/// `build()` snapshots the current attributes; the builder stays usable and
/// later changes never leak into messages already built.
///
/// ```rust
/// use bus_core::BusMessageBuilder;
///
/// let mut builder = BusMessageBuilder::new();
/// let msg = builder
///     .set_message_id("1")
///     .set_message_source("here")
///     .set_message_destination("there")
///     .set_attribute("colour", "blue")
///     .unwrap()
///     .build();
///
/// assert_eq!(msg.source(), Some("here"));
/// assert_eq!(msg.get("colour"), Some("blue"));
/// assert!(builder.set_attribute("_type", "x").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct BusMessageBuilder {
    attributes: HashMap<String, String>,
}

impl BusMessageBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_reserved(&mut self, attribute: ReservedAttribute, value: String) -> &mut Self {
        self.attributes.insert(attribute.name().to_string(), value);
        self
    }

    /// Set `_id`.
    pub fn set_message_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.set_reserved(ReservedAttribute::MessageId, id.into())
    }

    /// Set `_type`.
    pub fn set_message_type(&mut self, message_type: impl Into<String>) -> &mut Self {
        self.set_reserved(ReservedAttribute::MessageType, message_type.into())
    }

    /// Set `_src`.
    pub fn set_message_source(&mut self, source: impl Into<String>) -> &mut Self {
        self.set_reserved(ReservedAttribute::Source, source.into())
    }

    /// Set `_dst`.
    pub fn set_message_destination(&mut self, destination: impl Into<String>) -> &mut Self {
        self.set_reserved(ReservedAttribute::Destination, destination.into())
    }

    /// Set a user attribute.
    ///
    /// # Errors
    ///
    /// [`MessageError::ReservedAttributeName`] if `name` starts with `_`.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, MessageError> {
        let name = name.into();
        if name.starts_with(RESERVED_PREFIX) {
            return Err(MessageError::ReservedAttributeName { name });
        }
        self.attributes.insert(name, value.into());
        Ok(self)
    }

    /// Drop every attribute set so far.
    pub fn clear(&mut self) -> &mut Self {
        self.attributes.clear();
        self
    }

    /// Snapshot the current attributes into a new message.
    #[must_use]
    pub fn build(&self) -> BusMessage {
        BusMessage::from_attributes(self.attributes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_setters() {
        let msg = BusMessageBuilder::new()
            .set_message_id("42")
            .set_message_type("PRICE")
            .set_message_source("feed")
            .set_message_destination("book")
            .build();

        assert_eq!(msg.message_id(), Some("42"));
        assert_eq!(msg.message_type(), Some("PRICE"));
        assert_eq!(msg.source(), Some("feed"));
        assert_eq!(msg.destination(), Some("book"));
        assert_eq!(msg.get("_type"), Some("PRICE"));
        assert_eq!(msg.len(), 4);
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let mut builder = BusMessageBuilder::new();
        for name in ["_x", "_id", "_protocol", "_"] {
            let err = builder.set_attribute(name, "v").unwrap_err();
            assert_eq!(
                err,
                MessageError::ReservedAttributeName {
                    name: name.to_string()
                }
            );
        }
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_absent_attribute_is_none() {
        let msg = BusMessageBuilder::new().build();
        assert_eq!(msg.get("missing"), None);
        assert_eq!(msg.message_type(), None);
    }

    #[test]
    fn test_build_is_a_snapshot() {
        let mut builder = BusMessageBuilder::new();
        builder.set_attribute("k", "first").unwrap();
        let first = builder.build();

        builder.set_attribute("k", "second").unwrap();
        builder.set_message_id("7");
        let second = builder.build();

        assert_eq!(first.get("k"), Some("first"));
        assert_eq!(first.message_id(), None);
        assert_eq!(second.get("k"), Some("second"));
        assert_eq!(second.message_id(), Some("7"));
    }

    #[test]
    fn test_ingested_keeps_attributes() {
        let msg = BusMessageBuilder::new().set_message_id("1").build();
        assert_eq!(msg.origin(), Origin::Local);

        let ingested = msg.clone().into_ingested();
        assert!(ingested.is_from_peer());
        assert_eq!(ingested, msg);
    }

    #[test]
    fn test_reserved_attribute_names() {
        assert_eq!(ReservedAttribute::MessageId.name(), "_id");
        assert_eq!(ReservedAttribute::Source.name(), "_src");
        assert_eq!(ReservedAttribute::Destination.name(), "_dst");
        assert_eq!(ReservedAttribute::MessageType.name(), "_type");
        assert_eq!(ReservedAttribute::Protocol.to_string(), "_protocol");
    }
}
