//! # Subscriptions
//!
//! A subscription is a pure predicate over one reserved attribute. Matching is
//! exact string equality: no wildcards, no case folding.

use crate::message::{BusMessage, ReservedAttribute};
use std::fmt;

/// Which messages a handler wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// `_type` equals the given value.
    MessageType(String),
    /// `_src` equals the given value.
    Source(String),
    /// `_dst` equals the given value.
    Destination(String),
    /// Every message.
    All,
}

impl Subscription {
    /// Match on `_type`.
    #[must_use]
    pub fn message_type(value: impl Into<String>) -> Self {
        Self::MessageType(value.into())
    }

    /// Match on `_src`.
    #[must_use]
    pub fn source(value: impl Into<String>) -> Self {
        Self::Source(value.into())
    }

    /// Match on `_dst`.
    #[must_use]
    pub fn destination(value: impl Into<String>) -> Self {
        Self::Destination(value.into())
    }

    /// Match every message.
    #[must_use]
    pub fn all() -> Self {
        Self::All
    }

    /// The reserved attribute this subscription inspects, if any.
    #[must_use]
    pub fn attribute(&self) -> Option<ReservedAttribute> {
        match self {
            Self::MessageType(_) => Some(ReservedAttribute::MessageType),
            Self::Source(_) => Some(ReservedAttribute::Source),
            Self::Destination(_) => Some(ReservedAttribute::Destination),
            Self::All => None,
        }
    }

    /// Check whether a message matches.
    #[must_use]
    pub fn matches(&self, msg: &BusMessage) -> bool {
        match self {
            Self::MessageType(want) => msg.message_type() == Some(want.as_str()),
            Self::Source(want) => msg.source() == Some(want.as_str()),
            Self::Destination(want) => msg.destination() == Some(want.as_str()),
            Self::All => true,
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageType(v) => write!(f, "{}={v}", ReservedAttribute::MessageType),
            Self::Source(v) => write!(f, "{}={v}", ReservedAttribute::Source),
            Self::Destination(v) => write!(f, "{}={v}", ReservedAttribute::Destination),
            Self::All => f.write_str("*"),
        }
    }
}
