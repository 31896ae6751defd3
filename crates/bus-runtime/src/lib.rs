//! # Bus Runtime
//!
//! Assembles a process bus out of its parts.
//!
//! ## Components
//!
//! | Type | Role |
//! |------|------|
//! | [`BusBuilder`] | Collects servers, static peers, beacons and discovery groups |
//! | [`Bus`] | Application handle: `publish`, `subscribe`, `start`, `close` |
//! | [`BusRouter`] | Task owning every connection; forwards local messages out and peer messages in |
//! | [`BusConfig`] | TOML configuration with environment overrides |
//!
//! ## Message Flow
//!
//! ```text
//! Bus::publish ──→ LocalDispatcher ──→ local subscribers
//!                        │
//!                        └──→ BusRouter ──→ every connection ──→ peers
//!
//! peer ──→ connection ──→ BusRouter ──tagged as peer──→ LocalDispatcher ──→ local subscribers
//! ```
//!
//! Messages that came from a peer are never forwarded again, so two buses
//! connected both ways do not echo.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod builder;
pub mod bus;
pub mod config;
pub mod error;
pub mod router;

// Re-export main types
pub use builder::BusBuilder;
pub use bus::Bus;
pub use config::{BusConfig, ServiceGroup};
pub use error::{BusError, ConfigError};
pub use router::{BusRouter, RouterRegistry};
