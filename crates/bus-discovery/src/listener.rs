//! # Discovery Listener
//!
//! Joins a multicast group and turns announcements for services of interest
//! into client connections handed to a [`ConnectionRegistry`].
//!
//! An announced address is tracked from the moment a client is created for it
//! until that client closes, so one peer yields one connection, and a peer
//! that drops is picked up again by its next announcement.

use crate::announcement::Announcement;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::multicast::{group_addr, join_group};
use async_trait::async_trait;
use bus_core::{BusMessage, MessageHandler, Subscription, SubscriptionHandle, WireCodec};
use bus_transport::{
    CloseHook, CloseHooks, Connection, ConnectionKind, ConnectionRegistry, ConnectionUri,
    SocketClient, TlsSettings, TransportConfig, TransportError,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const NEW: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Pause after a failed receive before trying again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

type Tracked = Arc<Mutex<HashSet<ConnectionUri>>>;

struct ListenerInner {
    uri: ConnectionUri,
    group: SocketAddr,
    services: HashSet<String>,
    registry: Arc<dyn ConnectionRegistry>,
    config: DiscoveryConfig,
    transport: TransportConfig,
    tls: TlsSettings,
    tracked: Tracked,
    hooks: CloseHooks,
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerInner {
    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let announcement = match Announcement::decode(datagram) {
            Ok(Some(announcement)) => announcement,
            Ok(None) => return,
            Err(e) => {
                debug!(group = %self.uri, from = %from, error = %e, "Ignoring announcement");
                return;
            }
        };
        if !self.services.contains(&announcement.service) {
            trace!(service = %announcement.service, "Not a service of interest");
            return;
        }

        let address = announcement.address;
        if !self.tracked.lock().insert(address.clone()) {
            return;
        }
        let untrack = |tracked: &Tracked| {
            tracked.lock().remove(&address);
        };

        let client = match SocketClient::with_settings(
            address.clone(),
            WireCodec::new(announcement.protocol),
            self.transport.clone(),
            self.tls.clone(),
        ) {
            Ok(client) => client,
            Err(e) => {
                untrack(&self.tracked);
                warn!(
                    service = %announcement.service,
                    address = %address,
                    error = %e,
                    "Unusable announced address"
                );
                return;
            }
        };

        let tracked = Arc::downgrade(&self.tracked);
        client.on_close(Box::new(move |uri: &ConnectionUri| {
            if let Some(tracked) = tracked.upgrade() {
                tracked.lock().remove(uri);
                debug!(address = %uri, "Discovered peer untracked");
            }
        }));

        match self.registry.add_connection(Arc::new(client)).await {
            Ok(true) => info!(
                service = %announcement.service,
                address = %address,
                protocol = %announcement.protocol,
                "Discovered peer"
            ),
            Ok(false) => {
                untrack(&self.tracked);
                debug!(address = %address, "Discovered peer already connected");
            }
            Err(e) => {
                untrack(&self.tracked);
                warn!(
                    service = %announcement.service,
                    address = %address,
                    error = %e,
                    "Could not add discovered peer"
                );
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn receive_loop(weak: Weak<ListenerInner>, socket: UdpSocket, config: DiscoveryConfig) {
    let mut buf = vec![0u8; config.max_datagram_bytes];
    loop {
        let received = tokio::time::timeout(config.receive_timeout, socket.recv_from(&mut buf));
        match received.await {
            // Receive timeout: only a chance to notice the listener is gone
            Err(_) => {
                if weak.strong_count() == 0 {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Discovery receive failed");
                tokio::time::sleep(RECEIVE_BACKOFF).await;
            }
            Ok(Ok((len, from))) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.handle_datagram(&buf[..len], from).await;
            }
        }
    }
}

/// Multicast discovery receiver.
#[derive(Clone)]
pub struct DiscoveryListener {
    inner: Arc<ListenerInner>,
}

impl DiscoveryListener {
    /// Listen on `group` for `services`, adding discovered peers to `registry`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotMulticast`] if `group` is not a multicast URI.
    pub fn new<I, S>(
        group: ConnectionUri,
        services: I,
        registry: Arc<dyn ConnectionRegistry>,
    ) -> Result<Self, DiscoveryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_settings(
            group,
            services,
            registry,
            DiscoveryConfig::default(),
            TransportConfig::default(),
            TlsSettings::default(),
        )
    }

    /// Like [`new`](Self::new), with explicit discovery settings and the
    /// settings used for discovered client connections.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotMulticast`] if `group` is not a multicast URI.
    pub fn with_settings<I, S>(
        group: ConnectionUri,
        services: I,
        registry: Arc<dyn ConnectionRegistry>,
        config: DiscoveryConfig,
        transport: TransportConfig,
        tls: TlsSettings,
    ) -> Result<Self, DiscoveryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group_socket = group_addr(&group)?;
        Ok(Self {
            inner: Arc::new(ListenerInner {
                uri: group,
                group: group_socket,
                services: services.into_iter().map(Into::into).collect(),
                registry,
                config,
                transport,
                tls,
                tracked: Arc::new(Mutex::new(HashSet::new())),
                hooks: CloseHooks::new(),
                state: AtomicU8::new(NEW),
                task: Mutex::new(None),
            }),
        })
    }

    /// True if announcements for `service` are acted on.
    #[must_use]
    pub fn is_interested_in(&self, service: &str) -> bool {
        self.inner.services.contains(service)
    }

    /// True while a connection to `address` exists.
    #[must_use]
    pub fn is_tracked(&self, address: &ConnectionUri) -> bool {
        self.inner.tracked.lock().contains(address)
    }

    /// Number of peers currently connected through discovery.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    /// Act on one datagram received on the group from `from`.
    ///
    /// The receive loop calls this for every datagram; it can also be fed
    /// directly when datagrams arrive by some other path.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        self.inner.handle_datagram(datagram, from).await;
    }
}

#[async_trait]
impl Connection for DiscoveryListener {
    fn uri(&self) -> &ConnectionUri {
        &self.inner.uri
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Listener
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self
            .inner
            .state
            .compare_exchange(NEW, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return match self.inner.state.load(Ordering::SeqCst) {
                OPEN => Ok(()),
                _ => Err(TransportError::Closed {
                    uri: self.inner.uri.clone(),
                }),
            };
        }

        let socket = match join_group(self.inner.group, &self.inner.config) {
            Ok(socket) => socket,
            Err(source) => {
                self.inner.state.store(CLOSED, Ordering::SeqCst);
                warn!(group = %self.inner.uri, error = %source, "Failed to join group");
                self.inner.hooks.fire(&self.inner.uri);
                return Err(TransportError::Bind {
                    uri: self.inner.uri.clone(),
                    source,
                });
            }
        };

        {
            let mut task = self.inner.task.lock();
            if self.inner.state.load(Ordering::SeqCst) != OPEN {
                return Err(TransportError::Closed {
                    uri: self.inner.uri.clone(),
                });
            }
            *task = Some(tokio::spawn(receive_loop(
                Arc::downgrade(&self.inner),
                socket,
                self.inner.config.clone(),
            )));
        }

        info!(
            group = %self.inner.uri,
            services = ?self.inner.services,
            "Discovery listener started"
        );
        Ok(())
    }

    fn push(&self, _msg: &BusMessage) -> Result<(), TransportError> {
        Ok(())
    }

    fn pull(
        &self,
        _subscription: Subscription,
        _handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        SubscriptionHandle::closed()
    }

    fn on_close(&self, hook: CloseHook) {
        self.inner.hooks.add(&self.inner.uri, hook);
    }

    async fn close(&self) -> Result<(), TransportError> {
        let task = {
            let mut task = self.inner.task.lock();
            self.inner.state.store(CLOSED, Ordering::SeqCst);
            task.take()
        };
        // Not awaited: the task may itself be waiting on the registry
        // that is closing us.
        if let Some(task) = task {
            task.abort();
        }
        if self.inner.hooks.fire(&self.inner.uri) {
            info!(group = %self.inner.uri, "Discovery listener stopped");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == OPEN
    }
}

impl fmt::Debug for DiscoveryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryListener")
            .field("group", &self.inner.uri)
            .field("services", &self.inner.services)
            .field("tracked", &self.tracked_count())
            .field("open", &self.is_open())
            .finish()
    }
}
