//! # Discovery Beacon
//!
//! Periodically announces one service on a multicast group. The beacon is a
//! [`Connection`] so the router can own and close it, but it carries no bus
//! traffic: `push` does nothing and `pull` hands back a closed handle.

use crate::announcement::Announcement;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::multicast::{group_addr, open_sender};
use async_trait::async_trait;
use bus_core::{BusMessage, CodecKind, MessageHandler, Subscription, SubscriptionHandle};
use bus_transport::{
    CloseHook, CloseHooks, Connection, ConnectionKind, ConnectionUri, SocketServer,
    TransportError,
};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const NEW: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Where the announced address comes from.
#[derive(Debug, Clone)]
pub enum AddressSource {
    /// A fixed URI.
    Fixed(ConnectionUri),
    /// Whatever the server reports once bound.
    Server(SocketServer),
}

impl AddressSource {
    fn current(&self) -> ConnectionUri {
        match self {
            Self::Fixed(uri) => uri.clone(),
            Self::Server(server) => server.advertised_uri(),
        }
    }
}

struct BeaconInner {
    service: String,
    uri: ConnectionUri,
    group: SocketAddr,
    address: AddressSource,
    protocol: CodecKind,
    config: DiscoveryConfig,
    hooks: CloseHooks,
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BeaconInner {
    fn announcement(&self) -> Announcement {
        Announcement::new(self.service.clone(), self.address.current(), self.protocol)
    }
}

impl Drop for BeaconInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn announce_loop(weak: Weak<BeaconInner>, socket: UdpSocket, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let announcement = inner.announcement();
        let group = inner.group;
        drop(inner);

        let datagram = match announcement.encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(
                    service = %announcement.service,
                    error = %e,
                    "Cannot encode announcement"
                );
                continue;
            }
        };
        match socket.send_to(&datagram, group).await {
            Ok(_) => debug!(
                service = %announcement.service,
                address = %announcement.address,
                "Announced"
            ),
            Err(e) => warn!(group = %group, error = %e, "Announcement failed"),
        }
    }
}

/// Multicast announcer for one service.
#[derive(Clone)]
pub struct DiscoveryBeacon {
    inner: Arc<BeaconInner>,
}

impl DiscoveryBeacon {
    /// Announce `service` at `address`, speaking `protocol`, on `group`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotMulticast`] if `group` is not a multicast URI.
    pub fn new(
        service: impl Into<String>,
        group: ConnectionUri,
        address: AddressSource,
        protocol: CodecKind,
        config: DiscoveryConfig,
    ) -> Result<Self, DiscoveryError> {
        let group_socket = group_addr(&group)?;
        Ok(Self {
            inner: Arc::new(BeaconInner {
                service: service.into(),
                uri: group,
                group: group_socket,
                address,
                protocol,
                config,
                hooks: CloseHooks::new(),
                state: AtomicU8::new(NEW),
                task: Mutex::new(None),
            }),
        })
    }

    /// Announce a server under its advertised address and codec.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotMulticast`] if `group` is not a multicast URI.
    pub fn for_server(
        service: impl Into<String>,
        group: ConnectionUri,
        server: &SocketServer,
        config: DiscoveryConfig,
    ) -> Result<Self, DiscoveryError> {
        let protocol = server.codec().kind();
        Self::new(
            service,
            group,
            AddressSource::Server(server.clone()),
            protocol,
            config,
        )
    }

    /// Service name announced.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// The announcement as it would be sent now.
    #[must_use]
    pub fn announcement(&self) -> Announcement {
        self.inner.announcement()
    }
}

#[async_trait]
impl Connection for DiscoveryBeacon {
    fn uri(&self) -> &ConnectionUri {
        &self.inner.uri
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Beacon
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

        let checked = self
            .inner
            .announcement()
            .encode()
            .map_err(TransportError::from)
            .and_then(|_| {
                open_sender(self.inner.group, &self.inner.config).map_err(|source| {
                    TransportError::Bind {
                        uri: self.inner.uri.clone(),
                        source,
                    }
                })
            });
        let socket = match checked {
            Ok(socket) => socket,
            Err(e) => {
                self.inner.state.store(CLOSED, Ordering::SeqCst);
                warn!(
                    group = %self.inner.uri,
                    service = %self.inner.service,
                    error = %e,
                    "Beacon failed to start"
                );
                self.inner.hooks.fire(&self.inner.uri);
                return Err(e);
            }
        };

        {
            let mut task = self.inner.task.lock();
            if self.inner.state.load(Ordering::SeqCst) != OPEN {
                return Err(TransportError::Closed {
                    uri: self.inner.uri.clone(),
                });
            }
            *task = Some(tokio::spawn(announce_loop(
                Arc::downgrade(&self.inner),
                socket,
                self.inner.config.beacon_interval,
            )));
        }

        info!(
            group = %self.inner.uri,
            service = %self.inner.service,
            protocol = %self.inner.protocol,
            "Beacon started"
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
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if self.inner.hooks.fire(&self.inner.uri) {
            info!(group = %self.inner.uri, service = %self.inner.service, "Beacon stopped");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == OPEN
    }
}

impl fmt::Debug for DiscoveryBeacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryBeacon")
            .field("service", &self.inner.service)
            .field("group", &self.inner.uri)
            .field("protocol", &self.inner.protocol)
            .field("open", &self.is_open())
            .finish()
    }
}
