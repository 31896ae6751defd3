//! # Socket Server
//!
//! Accepts any number of peers on one listening socket. Every accepted peer
//! gets its own session task (reader plus writer) feeding one shared inbound
//! table. `push` broadcasts one encoded frame to every peer's queue, so a
//! stalled peer only ever delays itself. Queues are bounded; a peer whose
//! queue fills up is disconnected.

use crate::config::TransportConfig;
use crate::connection::{
    CloseHook, CloseHooks, Connection, ConnectionKind, STATE_CLOSED, STATE_NEW, STATE_OPEN,
};
use crate::error::TransportError;
use crate::stream::{
    frame_queue, read_frames, write_frames, FrameReceiver, FrameSender, ReadOutcome,
};
use crate::tls::{BoxedStream, TlsSettings};
use crate::uri::{local_host_address, ConnectionUri, Scheme};
use async_trait::async_trait;
use bus_core::{
    BusMessage, MessageHandler, Subscription, SubscriptionHandle, SubscriptionTable, WireCodec,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct PeerLink {
    addr: SocketAddr,
    frames: FrameSender,
    session: JoinHandle<()>,
}

struct ServerInner {
    uri: ConnectionUri,
    codec: WireCodec,
    config: TransportConfig,
    tls: TlsSettings,
    table: SubscriptionTable,
    hooks: CloseHooks,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    peers: Mutex<HashMap<u64, PeerLink>>,
    next_peer: AtomicU64,
}

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, acceptor: Option<TlsAcceptor>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Could not disable Nagle");
        }
        // Insert under the lock so a session that ends at once still finds
        // itself, and so close() either drains this peer or we see CLOSED
        let mut peers = self.peers.lock();
        if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
            debug!(uri = %self.uri, peer = %addr, "Server closed; dropping accepted stream");
            return;
        }
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (frames, queue) = frame_queue(&self.config);
        let session = tokio::spawn(run_session(
            Arc::downgrade(self),
            id,
            stream,
            addr,
            queue,
            acceptor,
        ));
        peers.insert(
            id,
            PeerLink {
                addr,
                frames,
                session,
            },
        );
        info!(uri = %self.uri, peer = %addr, peers = peers.len(), "Peer connected");
    }

    fn forget(&self, id: u64) {
        if let Some(peer) = self.peers.lock().remove(&id) {
            debug!(uri = %self.uri, peer = %peer.addr, "Peer removed");
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(accept) = self.accept.get_mut().take() {
            accept.abort();
        }
        for (_, peer) in self.peers.get_mut().drain() {
            peer.session.abort();
        }
    }
}

async fn accept_loop(weak: Weak<ServerInner>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.admit(stream, addr, acceptor.clone());
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn run_session(
    weak: Weak<ServerInner>,
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    queue: FrameReceiver,
    acceptor: Option<TlsAcceptor>,
) {
    let Some((codec, table, config)) = weak
        .upgrade()
        .map(|inner| (inner.codec.clone(), inner.table.clone(), inner.config.clone()))
    else {
        return;
    };

    let stream: BoxedStream = match acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(config.connect_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Box::new(tls),
                Ok(Err(e)) => {
                    warn!(peer = %addr, error = %e, "TLS handshake failed");
                    forget(&weak, id);
                    return;
                }
                Err(_) => {
                    warn!(peer = %addr, "TLS handshake timed out");
                    forget(&weak, id);
                    return;
                }
            }
        }
        None => Box::new(stream),
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let peer = addr.to_string();
    tokio::select! {
        outcome = read_frames(read_half, &codec, &table, &config, &peer) => match outcome {
            ReadOutcome::Eof => info!(peer = %addr, "Peer disconnected"),
            ReadOutcome::Failed(e) => warn!(peer = %addr, error = %e, "Peer session failed"),
        },
        result = write_frames(write_half, queue) => {
            if let Err(e) = result {
                warn!(peer = %addr, error = %e, "Peer write failed");
            }
        }
    }

    forget(&weak, id);
}

fn forget(weak: &Weak<ServerInner>, id: u64) {
    if let Some(inner) = weak.upgrade() {
        inner.forget(id);
    }
}

/// Listening connection that fans out to every accepted peer.
///
/// `socket://` URIs accept plain TCP; `ssl://` URIs require a server TLS
/// configuration.
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<ServerInner>,
}

impl SocketServer {
    /// Create an unstarted server.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnsupportedScheme`] for anything but `socket` or `ssl`.
    pub fn new(uri: ConnectionUri, codec: WireCodec) -> Result<Self, TransportError> {
        Self::with_settings(uri, codec, TransportConfig::default(), TlsSettings::default())
    }

    /// Create an unstarted server with explicit settings.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnsupportedScheme`] for anything but `socket` or `ssl`.
    pub fn with_settings(
        uri: ConnectionUri,
        codec: WireCodec,
        config: TransportConfig,
        tls: TlsSettings,
    ) -> Result<Self, TransportError> {
        if !matches!(uri.scheme(), Scheme::Socket | Scheme::Ssl) {
            return Err(TransportError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
            });
        }
        Ok(Self {
            inner: Arc::new(ServerInner {
                uri,
                codec,
                config,
                tls,
                table: SubscriptionTable::new(),
                hooks: CloseHooks::new(),
                state: AtomicU8::new(STATE_NEW),
                local_addr: Mutex::new(None),
                accept: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(1),
            }),
        })
    }

    /// Codec used on this connection.
    #[must_use]
    pub fn codec(&self) -> &WireCodec {
        &self.inner.codec
    }

    /// Address actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Address peers should connect to.
    ///
    /// Uses the bound port (so port 0 resolves) and replaces an unspecified
    /// bind host with this machine's address.
    #[must_use]
    pub fn advertised_uri(&self) -> ConnectionUri {
        let uri = &self.inner.uri;
        let Some(bound) = self.local_addr() else {
            return uri.clone();
        };
        let host = match uri.ip() {
            Some(ip) if ip.is_unspecified() => local_host_address().to_string(),
            _ => uri.host().to_string(),
        };
        ConnectionUri::new(uri.scheme(), host, bound.port())
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    fn acceptor(&self) -> Result<Option<TlsAcceptor>, TransportError> {
        match self.inner.uri.scheme() {
            Scheme::Ssl => self
                .inner
                .tls
                .acceptor()
                .map(Some)
                .ok_or_else(|| TransportError::TlsNotConfigured {
                    uri: self.inner.uri.clone(),
                }),
            _ => Ok(None),
        }
    }

    fn fail_start(&self, error: TransportError) -> TransportError {
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        warn!(uri = %self.inner.uri, error = %error, "Failed to listen");
        self.inner.hooks.fire(&self.inner.uri);
        error
    }
}

#[async_trait]
impl Connection for SocketServer {
    fn uri(&self) -> &ConnectionUri {
        &self.inner.uri
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Server
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self
            .inner
            .state
            .compare_exchange(STATE_NEW, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return match self.inner.state.load(Ordering::SeqCst) {
                STATE_OPEN => Ok(()),
                _ => Err(TransportError::Closed {
                    uri: self.inner.uri.clone(),
                }),
            };
        }

        let acceptor = match self.acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => return Err(self.fail_start(e)),
        };

        let listener = match TcpListener::bind(self.inner.uri.authority()).await {
            Ok(listener) => listener,
            Err(source) => {
                return Err(self.fail_start(TransportError::Bind {
                    uri: self.inner.uri.clone(),
                    source,
                }))
            }
        };
        let bound = listener.local_addr().ok();
        *self.inner.local_addr.lock() = bound;

        {
            let mut accept = self.inner.accept.lock();
            if self.inner.state.load(Ordering::SeqCst) != STATE_OPEN {
                return Err(TransportError::Closed {
                    uri: self.inner.uri.clone(),
                });
            }
            *accept = Some(tokio::spawn(accept_loop(
                Arc::downgrade(&self.inner),
                listener,
                acceptor,
            )));
        }

        info!(
            uri = %self.inner.uri,
            bound = ?bound,
            codec = %self.inner.codec.kind(),
            tls = self.inner.uri.scheme() == Scheme::Ssl,
            "Listening"
        );
        Ok(())
    }

    fn push(&self, msg: &BusMessage) -> Result<(), TransportError> {
        if self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return Err(TransportError::Closed {
                uri: self.inner.uri.clone(),
            });
        }
        let frame: Arc<[u8]> = self.inner.codec.encode(msg)?.into();

        self.inner.peers.lock().retain(|_, peer| {
            match peer.frames.try_send(Arc::clone(&frame)) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => warn!(
                    uri = %self.inner.uri,
                    peer = %peer.addr,
                    capacity = self.inner.config.queue_capacity(),
                    "Peer is not draining its queue; disconnecting"
                ),
                Err(TrySendError::Closed(_)) => {
                    debug!(peer = %peer.addr, "Dropping peer with closed queue");
                }
            }
            // Aborting the session drops its socket
            peer.session.abort();
            false
        });
        Ok(())
    }

    fn pull(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.inner.table.register_arc(subscription, handler)
    }

    fn on_close(&self, hook: CloseHook) {
        self.inner.hooks.add(&self.inner.uri, hook);
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (accept, peers) = {
            let mut accept = self.inner.accept.lock();
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
            let peers: Vec<PeerLink> = self.inner.peers.lock().drain().map(|(_, p)| p).collect();
            (accept.take(), peers)
        };

        if let Some(accept) = accept {
            accept.abort();
            // Wait for the listener socket to be released
            let _ = accept.await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.close_linger;
        for peer in peers {
            drop(peer.frames);
            let mut session = peer.session;
            if tokio::time::timeout_at(deadline, &mut session).await.is_err() {
                session.abort();
            }
        }

        if self.inner.hooks.fire(&self.inner.uri) {
            info!(uri = %self.inner.uri, "Server closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_OPEN
    }
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("uri", &self.inner.uri)
            .field("bound", &self.local_addr())
            .field("peers", &self.peer_count())
            .field("open", &self.is_open())
            .finish()
    }
}
