//! # Bus Transport - Socket Connections
//!
//! TCP and TLS transports for the process bus.
//!
//! ## Connections
//!
//! | Type | Role |
//! |------|------|
//! | [`SocketClient`] | One outbound `socket://` or `ssl://` connection |
//! | [`SocketServer`] | Listener broadcasting to every accepted peer |
//!
//! Both implement [`Connection`]: `start`, `push`, `pull`, `on_close`,
//! `close`. Frames on the wire are produced by [`bus_core::WireCodec`].
//!
//! ## Task Model
//!
//! ```text
//! push() ──encode──→ [frame queue] ──→ writer task ──→ socket
//! socket ──→ reader task ──split on EOT──→ decode ──→ inbound table ──→ pull() handlers
//! ```
//!
//! `push` never waits on the network. Closing a connection aborts its reader
//! and gives the writer a short linger to flush what is queued.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub(crate) mod stream;
pub mod tls;
pub mod uri;

// Re-export main types
pub use client::SocketClient;
pub use config::TransportConfig;
pub use connection::{
    CloseHook, CloseHooks, Connection, ConnectionKey, ConnectionKind, ConnectionRegistry,
};
pub use error::{RegistryError, TransportError};
pub use server::SocketServer;
pub use tls::TlsSettings;
pub use uri::{local_host_address, ConnectionUri, Scheme};

/// TLS types callers need to build [`TlsSettings`].
pub use rustls::pki_types::{CertificateDer, PrivateKeyDer};
