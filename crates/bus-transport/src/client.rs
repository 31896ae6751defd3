//! # Socket Client
//!
//! One outbound TCP or TLS connection. A reader task feeds the inbound table;
//! a writer task drains the outbound frame queue. The queue exists from
//! construction, so frames pushed while connecting are sent once the socket
//! is up. If the queue fills because the peer stopped reading, the
//! connection is closed.

use crate::config::TransportConfig;
use crate::connection::{
    CloseHook, CloseHooks, Connection, ConnectionKind, STATE_CLOSED, STATE_CONNECTING, STATE_NEW,
    STATE_OPEN,
};
use crate::error::TransportError;
use crate::stream::{
    frame_queue, read_frames, write_frames, FrameReceiver, FrameSender, ReadOutcome,
};
use crate::tls::{server_name, BoxedStream, TlsSettings};
use crate::uri::{ConnectionUri, Scheme};
use async_trait::async_trait;
use bus_core::{
    BusMessage, MessageHandler, Subscription, SubscriptionHandle, SubscriptionTable, WireCodec,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientInner {
    uri: ConnectionUri,
    codec: WireCodec,
    config: TransportConfig,
    tls: TlsSettings,
    table: SubscriptionTable,
    hooks: CloseHooks,
    state: AtomicU8,
    frames: Mutex<Option<FrameSender>>,
    queue: Mutex<Option<FrameReceiver>>,
    tasks: Mutex<Option<Tasks>>,
}

impl ClientInner {
    fn closed(&self) -> TransportError {
        TransportError::Closed {
            uri: self.uri.clone(),
        }
    }

    /// Tear down after the reader stopped on its own.
    fn terminate(&self, outcome: &ReadOutcome) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        self.frames.lock().take();
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.writer.abort();
        }
        match outcome {
            ReadOutcome::Eof => info!(uri = %self.uri, "Peer closed connection"),
            ReadOutcome::Failed(e) => warn!(uri = %self.uri, error = %e, "Connection failed"),
        }
        self.hooks.fire(&self.uri);
    }

    /// Give up on a peer that stopped draining its queue.
    fn overflow(&self) -> TransportError {
        let error = TransportError::SendQueueFull {
            uri: self.uri.clone(),
            capacity: self.config.queue_capacity(),
        };
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return error;
        }
        self.frames.lock().take();
        self.queue.lock().take();
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
        warn!(uri = %self.uri, error = %error, "Peer is not draining its queue; disconnecting");
        self.hooks.fire(&self.uri);
        error
    }

    fn fail_start(&self, error: TransportError) -> TransportError {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.frames.lock().take();
        self.queue.lock().take();
        warn!(uri = %self.uri, error = %error, "Failed to connect");
        self.hooks.fire(&self.uri);
        error
    }

    async fn open_stream(&self) -> Result<BoxedStream, TransportError> {
        let connector = match self.uri.scheme() {
            Scheme::Ssl => Some(self.tls.connector(&self.uri)?),
            _ => None,
        };

        let tcp = TcpStream::connect(self.uri.authority())
            .await
            .map_err(|source| TransportError::Connect {
                uri: self.uri.clone(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        let Some(connector) = connector else {
            return Ok(Box::new(tcp));
        };
        let tls = connector
            .connect(server_name(&self.uri)?, tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

/// Outbound connection to one peer over `socket://` or `ssl://`.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

impl SocketClient {
    /// Create an unstarted client.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnsupportedScheme`] for anything but `socket` or `ssl`.
    pub fn new(uri: ConnectionUri, codec: WireCodec) -> Result<Self, TransportError> {
        Self::with_settings(uri, codec, TransportConfig::default(), TlsSettings::default())
    }

    /// Create an unstarted client with explicit settings.
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
        let (frames, queue) = frame_queue(&config);
        Ok(Self {
            inner: Arc::new(ClientInner {
                uri,
                codec,
                config,
                tls,
                table: SubscriptionTable::new(),
                hooks: CloseHooks::new(),
                state: AtomicU8::new(STATE_NEW),
                frames: Mutex::new(Some(frames)),
                queue: Mutex::new(Some(queue)),
                tasks: Mutex::new(None),
            }),
        })
    }

    /// Codec used on this connection.
    #[must_use]
    pub fn codec(&self) -> &WireCodec {
        &self.inner.codec
    }

    fn spawn_tasks(&self, stream: BoxedStream, queue: FrameReceiver) -> Tasks {
        let (read_half, write_half) = tokio::io::split(stream);

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let codec = self.inner.codec.clone();
        let table = self.inner.table.clone();
        let config = self.inner.config.clone();
        let peer = self.inner.uri.to_string();
        let reader = tokio::spawn(async move {
            let outcome = read_frames(read_half, &codec, &table, &config, &peer).await;
            if let Some(inner) = weak.upgrade() {
                inner.terminate(&outcome);
            }
        });

        let uri = self.inner.uri.clone();
        let writer = tokio::spawn(async move {
            if let Err(e) = write_frames(write_half, queue).await {
                debug!(uri = %uri, error = %e, "Writer stopped");
            }
        });

        Tasks { reader, writer }
    }
}

#[async_trait]
impl Connection for SocketClient {
    fn uri(&self) -> &ConnectionUri {
        &self.inner.uri
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Client
    }

    async fn start(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if let Err(state) = inner.state.compare_exchange(
            STATE_NEW,
            STATE_CONNECTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match state {
                STATE_CLOSED => Err(inner.closed()),
                _ => Ok(()),
            };
        }

        let stream = match tokio::time::timeout(inner.config.connect_timeout, inner.open_stream())
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(inner.fail_start(e)),
            Err(_) => {
                return Err(inner.fail_start(TransportError::ConnectTimeout {
                    uri: inner.uri.clone(),
                }))
            }
        };

        {
            let mut tasks = inner.tasks.lock();
            // close() may have run while connecting
            if inner
                .state
                .compare_exchange(STATE_CONNECTING, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(inner.closed());
            }
            let Some(queue) = inner.queue.lock().take() else {
                return Err(inner.closed());
            };
            *tasks = Some(self.spawn_tasks(stream, queue));
        }

        info!(uri = %inner.uri, codec = %inner.codec.kind(), "Connected");
        Ok(())
    }

    fn push(&self, msg: &BusMessage) -> Result<(), TransportError> {
        if self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return Err(self.inner.closed());
        }
        let frame: Arc<[u8]> = self.inner.codec.encode(msg)?.into();
        let sent = {
            let frames = self.inner.frames.lock();
            let Some(frames) = frames.as_ref() else {
                return Err(self.inner.closed());
            };
            frames.try_send(frame)
        };
        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(self.inner.overflow()),
            Err(TrySendError::Closed(_)) => Err(self.inner.closed()),
        }
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
        let tasks = {
            let mut tasks = self.inner.tasks.lock();
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
            tasks.take()
        };
        // Dropping the sender lets the writer drain and shut down
        self.inner.frames.lock().take();
        self.inner.queue.lock().take();

        if let Some(tasks) = tasks {
            tasks.reader.abort();
            let mut writer = tasks.writer;
            if tokio::time::timeout(self.inner.config.close_linger, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }

        if self.inner.hooks.fire(&self.inner.uri) {
            info!(uri = %self.inner.uri, "Connection closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_OPEN
    }
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient")
            .field("uri", &self.inner.uri)
            .field("codec", &self.inner.codec.kind())
            .field("open", &self.is_open())
            .finish()
    }
}
