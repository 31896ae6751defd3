//! # Bus Discovery - Multicast Announcements
//!
//! Lets bus processes find each other without fixed addresses.
//!
//! - [`DiscoveryBeacon`] announces a service and its connectable address on a
//!   multicast group about once a second.
//! - [`DiscoveryListener`] joins the group, and for every announced service it
//!   is interested in creates a client connection speaking the announced codec
//!   and hands it to a [`bus_transport::ConnectionRegistry`].
//!
//! Announcements are always cleartext frames; their `_protocol` attribute
//! names the codec of the announced service, not of the datagram.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod announcement;
pub mod beacon;
pub mod config;
pub mod error;
pub mod listener;
pub mod multicast;

// Re-export main types
pub use announcement::{Announcement, ADDRESS_ATTRIBUTE};
pub use beacon::{AddressSource, DiscoveryBeacon};
pub use config::DiscoveryConfig;
pub use error::DiscoveryError;
pub use listener::DiscoveryListener;
pub use multicast::group_addr;
