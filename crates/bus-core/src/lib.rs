//! # Bus Core - Messages, Subscriptions and Local Dispatch
//!
//! The in-process half of the process bus. Everything here is synchronous and
//! runtime-agnostic; the socket transports and the router build on top of it.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐   publish()   ┌─────────────────┐   on_message()   ┌─────────────┐
//! │  Publisher   │ ────────────→ │ LocalDispatcher │ ───────────────→ │  Handlers   │
//! └──────────────┘               └─────────────────┘   (matching)     └─────────────┘
//!                                        │
//!                                        │ all-messages subscription
//!                                        ▼
//!                                 ┌─────────────┐  WireCodec  ┌────────────┐
//!                                 │  BusRouter  │ ──────────→ │ Transports │
//!                                 └─────────────┘             └────────────┘
//! ```
//!
//! ## Wire Frame
//!
//! `(key ETX value LF)* EOT`, UTF-8, no length prefix and no escaping. Values
//! may never contain ETX, LF or EOT.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod codec;
pub mod dispatcher;
pub mod message;
pub mod registry;
pub mod subscription;

// Re-export main types
pub use codec::{CodecError, CodecKind, DecodedFrame, WireCodec};
pub use dispatcher::LocalDispatcher;
pub use message::{BusMessage, BusMessageBuilder, MessageError, Origin, ReservedAttribute};
pub use registry::{
    DispatchReport, HandlerError, HandlerResult, MessageHandler, SubscriptionHandle,
    SubscriptionId, SubscriptionTable,
};
pub use subscription::Subscription;

/// Attribute separator inside one frame line.
pub const ETX: u8 = 0x03;

/// Line terminator between attributes.
pub const LF: u8 = 0x0A;

/// Frame terminator.
pub const EOT: u8 = 0x04;

/// `_type` value carried by discovery announcements.
pub const DISCOVERY_MESSAGE_TYPE: &str = "DISCOVERY";
