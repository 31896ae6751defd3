//! # Connection Ports
//!
//! The capability set every transport offers the router, plus the port the
//! discovery listener uses to hand new connections to whoever owns them.

use crate::error::{RegistryError, TransportError};
use crate::uri::ConnectionUri;
use async_trait::async_trait;
use bus_core::{BusMessage, MessageHandler, Subscription, SubscriptionHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

// Lifecycle states shared by the socket transports
pub(crate) const STATE_NEW: u8 = 0;
pub(crate) const STATE_CONNECTING: u8 = 1;
pub(crate) const STATE_OPEN: u8 = 2;
pub(crate) const STATE_CLOSED: u8 = 3;

/// What role a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKind {
    /// Outbound socket to one peer.
    Client,
    /// Listening socket fanning out to every accepted peer.
    Server,
    /// Multicast announcer.
    Beacon,
    /// Multicast discovery receiver.
    Listener,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Beacon => "beacon",
            Self::Listener => "listener",
        })
    }
}

/// Identity of a connection. Equal keys are the same logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    /// Role.
    pub kind: ConnectionKind,
    /// Target or bound address.
    pub uri: ConnectionUri,
}

impl ConnectionKey {
    /// Create a key.
    #[must_use]
    pub fn new(kind: ConnectionKind, uri: ConnectionUri) -> Self {
        Self { kind, uri }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.uri)
    }
}

/// Callback run once when a connection closes.
pub type CloseHook = Box<dyn FnOnce(&ConnectionUri) + Send>;

enum HookState {
    Pending(Vec<CloseHook>),
    Fired,
}

/// Close hooks for one connection.
///
/// Every hook runs exactly once. A hook added after the connection closed
/// runs immediately.
pub struct CloseHooks {
    state: Mutex<HookState>,
}

impl CloseHooks {
    /// No hooks yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HookState::Pending(Vec::new())),
        }
    }

    /// Register a hook.
    pub fn add(&self, uri: &ConnectionUri, hook: CloseHook) {
        let mut state = self.state.lock();
        if let HookState::Pending(hooks) = &mut *state {
            hooks.push(hook);
            return;
        }
        drop(state);
        hook(uri);
    }

    /// Run every pending hook. Returns false if they already ran.
    pub fn fire(&self, uri: &ConnectionUri) -> bool {
        let hooks = match std::mem::replace(&mut *self.state.lock(), HookState::Fired) {
            HookState::Pending(hooks) => hooks,
            HookState::Fired => return false,
        };
        for hook in hooks {
            hook(uri);
        }
        true
    }

    /// True once the hooks have run.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        matches!(*self.state.lock(), HookState::Fired)
    }
}

impl Default for CloseHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHooks")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// One logical bus connection.
///
/// `push` and `pull` never block on the network: `push` enqueues an encoded
/// frame for a background writer, `pull` registers into the connection's
/// inbound table.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Target or bound address.
    fn uri(&self) -> &ConnectionUri;

    /// Role of this connection.
    fn kind(&self) -> ConnectionKind;

    /// Identity used for de-duplication.
    fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.kind(), self.uri().clone())
    }

    /// Open sockets and spawn background tasks.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`] from binding, connecting or the TLS handshake.
    /// A connection that fails to start is closed and its hooks have run.
    async fn start(&self) -> Result<(), TransportError>;

    /// Send one message to the remote side(s).
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the connection is gone, or a codec
    /// error if the message cannot be framed.
    fn push(&self, msg: &BusMessage) -> Result<(), TransportError>;

    /// Receive inbound messages matching `subscription`.
    fn pull(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle;

    /// Run `hook` once when this connection closes.
    fn on_close(&self, hook: CloseHook);

    /// Stop background tasks and release sockets. Idempotent.
    ///
    /// # Errors
    ///
    /// Reserved for transports whose shutdown can fail; the socket
    /// transports always succeed.
    async fn close(&self) -> Result<(), TransportError>;

    /// True between a successful `start` and `close`.
    fn is_open(&self) -> bool;
}

/// Accepts connections discovered at runtime.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Add a connection. Returns `Ok(false)` if an equal one is already
    /// registered, in which case `connection` is dropped unused.
    async fn add_connection(&self, connection: Arc<dyn Connection>)
        -> Result<bool, RegistryError>;
}
