//! # Bus Router
//!
//! Owns every connection of a bus and moves messages between them and the
//! local dispatcher.
//!
//! ## Task Model
//!
//! ```text
//! publish() ──→ LocalDispatcher ──all-messages──→ [command queue] ──→ router task ──push──→ connections
//! connection ──pull──→ publish_ingested() ──→ LocalDispatcher      (never forwarded again)
//! ```
//!
//! A single task owns the connection map. Adding, removing, starting,
//! closing, fan-out and "connection lost" notifications are all commands on
//! one queue, so a connection is never removed while a push to it is in
//! flight. Pushes only enqueue frames, so the router task never waits on a
//! socket.

use crate::error::BusError;
use async_trait::async_trait;
use bus_core::{
    BusMessage, HandlerError, HandlerResult, LocalDispatcher, Subscription, SubscriptionHandle,
};
use bus_transport::{Connection, ConnectionKey, ConnectionRegistry, ConnectionUri, RegistryError};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Add {
        connection: Arc<dyn Connection>,
        reply: Option<Reply<Result<bool, RegistryError>>>,
    },
    Remove {
        key: ConnectionKey,
        reply: Reply<Option<Arc<dyn Connection>>>,
    },
    Start {
        reply: Reply<Result<(), BusError>>,
    },
    Forward(BusMessage),
    Lost {
        key: ConnectionKey,
        connection: Weak<dyn Connection>,
    },
    Connections {
        reply: Reply<Vec<ConnectionKey>>,
    },
    Close {
        reply: Reply<Vec<Arc<dyn Connection>>>,
    },
}

fn respond<T>(reply: Option<Reply<T>>, value: T) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

struct Entry {
    connection: Arc<dyn Connection>,
    inbound: SubscriptionHandle,
}

/// Re-publish everything a connection receives, tagged as peer traffic.
fn wire_inbound(
    dispatcher: &Weak<LocalDispatcher>,
    connection: &Arc<dyn Connection>,
) -> SubscriptionHandle {
    let dispatcher = Weak::clone(dispatcher);
    connection.pull(
        Subscription::all(),
        Arc::new(move |msg: &BusMessage| -> HandlerResult {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.publish_ingested(msg.clone());
            }
            Ok(())
        }),
    )
}

struct RouterActor {
    dispatcher: Arc<LocalDispatcher>,
    commands: mpsc::WeakUnboundedSender<Command>,
    entries: BTreeMap<ConnectionKey, Entry>,
    outbound: SubscriptionHandle,
    started: bool,
}

impl RouterActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Add { connection, reply } => self.add(connection, reply),
                Command::Remove { key, reply } => {
                    let _ = reply.send(self.detach(&key));
                }
                Command::Start { reply } => {
                    let result = self.start().await;
                    let _ = reply.send(result);
                }
                Command::Forward(msg) => self.forward(&msg),
                Command::Lost { key, connection } => self.lost(&key, &connection),
                Command::Connections { reply } => {
                    let _ = reply.send(self.entries.keys().cloned().collect());
                }
                Command::Close { reply } => {
                    let _ = reply.send(self.close());
                    break;
                }
            }
        }
        debug!("Router task finished");
    }

    fn watch(&self, key: &ConnectionKey, connection: &Arc<dyn Connection>) {
        let commands = self.commands.clone();
        let key = key.clone();
        let weak = Arc::downgrade(connection);
        connection.on_close(Box::new(move |_: &ConnectionUri| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Lost {
                    key,
                    connection: weak,
                });
            }
        }));
    }

    fn add(
        &mut self,
        connection: Arc<dyn Connection>,
        reply: Option<Reply<Result<bool, RegistryError>>>,
    ) {
        let key = connection.key();
        if self.entries.contains_key(&key) {
            debug!(connection = %key, "Connection already registered");
            respond(reply, Ok(false));
            return;
        }

        self.watch(&key, &connection);
        let inbound = if self.started {
            wire_inbound(&Arc::downgrade(&self.dispatcher), &connection)
        } else {
            SubscriptionHandle::closed()
        };
        self.entries.insert(
            key.clone(),
            Entry {
                connection: Arc::clone(&connection),
                inbound,
            },
        );
        info!(connection = %key, started = self.started, "Connection added");

        if !self.started {
            respond(reply, Ok(true));
            return;
        }
        // Connect off the router task; a failed start fires the close hook
        // and the entry is dropped through `lost`.
        tokio::spawn(async move {
            let result = match connection.start().await {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!(connection = %key, error = %e, "Connection failed to start");
                    Err(RegistryError::Transport(e))
                }
            };
            respond(reply, result);
        });
    }

    fn detach(&mut self, key: &ConnectionKey) -> Option<Arc<dyn Connection>> {
        let mut entry = self.entries.remove(key)?;
        entry.inbound.close();
        Some(entry.connection)
    }

    fn subscribe_outbound(&self) -> SubscriptionHandle {
        let commands = self.commands.clone();
        self.dispatcher.subscribe(
            Subscription::all(),
            move |msg: &BusMessage| -> HandlerResult {
                if msg.is_from_peer() {
                    return Ok(());
                }
                let commands = commands
                    .upgrade()
                    .ok_or_else(|| HandlerError::Rejected("router is gone".to_string()))?;
                commands
                    .send(Command::Forward(msg.clone()))
                    .map_err(|_| HandlerError::Rejected("router is closed".to_string()))
            },
        )
    }

    async fn start(&mut self) -> Result<(), BusError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.outbound = self.subscribe_outbound();

        let dispatcher = Arc::downgrade(&self.dispatcher);
        let mut pending = Vec::with_capacity(self.entries.len());
        for (key, entry) in &mut self.entries {
            entry.inbound = wire_inbound(&dispatcher, &entry.connection);
            pending.push((key.clone(), Arc::clone(&entry.connection)));
        }

        // Concurrent start; failures are detached afterwards in key order
        let results = join_all(pending.into_iter().map(|(key, connection)| async move {
            let result = connection.start().await;
            (key, result)
        }))
        .await;

        let mut failed = Vec::new();
        for (key, result) in results {
            if let Err(e) = result {
                warn!(connection = %key, error = %e, "Connection failed to start; removed");
                self.detach(&key);
                failed.push((key, e));
            }
        }

        info!(
            connections = self.entries.len(),
            failed = failed.len(),
            "Router started"
        );
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BusError::PartialStart { failed })
        }
    }

    fn forward(&mut self, msg: &BusMessage) {
        if msg.is_from_peer() {
            return;
        }
        let mut dead = Vec::new();
        for (key, entry) in &self.entries {
            match entry.connection.push(msg) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => dead.push((key.clone(), e)),
                Err(e) => warn!(connection = %key, error = %e, "Message not forwarded"),
            }
        }

        for (key, e) in dead {
            let Some(connection) = self.detach(&key) else {
                continue;
            };
            warn!(connection = %key, error = %e, "Push failed; connection removed");
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
        }
    }

    fn lost(&mut self, key: &ConnectionKey, connection: &Weak<dyn Connection>) {
        // A replacement registered under the same key is not the one that closed
        let current = self.entries.get(key).is_some_and(|entry| {
            std::ptr::addr_eq(Arc::as_ptr(&entry.connection), connection.as_ptr())
        });
        if current {
            self.detach(key);
            warn!(connection = %key, "Connection closed; removed");
        }
    }

    fn close(&mut self) -> Vec<Arc<dyn Connection>> {
        self.outbound.close();
        let entries = std::mem::take(&mut self.entries);
        info!(connections = entries.len(), "Router closing");
        entries
            .into_values()
            .map(|mut entry| {
                entry.inbound.close();
                entry.connection
            })
            .collect()
    }
}

async fn add_via(
    commands: &mpsc::UnboundedSender<Command>,
    connection: Arc<dyn Connection>,
) -> Result<bool, RegistryError> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Add {
            connection,
            reply: Some(reply),
        })
        .map_err(|_| RegistryError::Closed)?;
    response.await.map_err(|_| RegistryError::Closed)?
}

/// Handle to a router task. Clones share the same router.
///
/// The task runs until [`close`](Self::close) or until every handle is
/// dropped.
#[derive(Clone)]
pub struct BusRouter {
    commands: mpsc::UnboundedSender<Command>,
}

impl BusRouter {
    /// Spawn a router for `dispatcher`. Connections added before
    /// [`start`](Self::start) are only wired and started then.
    ///
    /// # Errors
    ///
    /// [`BusError::NoRuntime`] outside a Tokio runtime.
    pub fn new(dispatcher: &Arc<LocalDispatcher>) -> Result<Self, BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let (commands, queue) = mpsc::unbounded_channel();
        let actor = RouterActor {
            dispatcher: Arc::clone(dispatcher),
            commands: commands.downgrade(),
            entries: BTreeMap::new(),
            outbound: SubscriptionHandle::closed(),
            started: false,
        };
        runtime.spawn(actor.run(queue));
        Ok(Self { commands })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        response.await.ok()
    }

    /// Queue a connection without waiting for the outcome.
    pub(crate) fn register(&self, connection: Arc<dyn Connection>) {
        let key = connection.key();
        if self
            .commands
            .send(Command::Add {
                connection,
                reply: None,
            })
            .is_err()
        {
            warn!(connection = %key, "Router closed; connection dropped");
        }
    }

    /// Add a connection. If the router is already started the connection is
    /// wired and started before this returns.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Closed`] after [`close`](Self::close), or the start
    /// failure of a connection added to a running router (which is then
    /// removed again).
    pub async fn add_connection(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<bool, RegistryError> {
        add_via(&self.commands, connection).await
    }

    /// Remove and close a connection. Returns false if it was not registered.
    ///
    /// # Errors
    ///
    /// [`BusError::Closed`] after [`close`](Self::close).
    pub async fn remove_connection(&self, key: &ConnectionKey) -> Result<bool, BusError> {
        let removed = self
            .request(|reply| Command::Remove {
                key: key.clone(),
                reply,
            })
            .await
            .ok_or(BusError::Closed)?;
        let Some(connection) = removed else {
            return Ok(false);
        };
        connection.close().await?;
        info!(connection = %key, "Connection removed");
        Ok(true)
    }

    /// Subscribe to the dispatcher and start every registered connection.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// [`BusError::PartialStart`] names the connections that failed; they
    /// have been removed and everything else is running.
    /// [`BusError::Closed`] after [`close`](Self::close).
    pub async fn start(&self) -> Result<(), BusError> {
        self.request(|reply| Command::Start { reply })
            .await
            .unwrap_or(Err(BusError::Closed))
    }

    /// Keys of the registered connections.
    pub async fn connections(&self) -> Vec<ConnectionKey> {
        self.request(|reply| Command::Connections { reply })
            .await
            .unwrap_or_default()
    }

    /// True if a connection with `key` is registered.
    pub async fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections().await.contains(key)
    }

    /// Unsubscribe from the dispatcher and close every connection.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Reserved; connection close failures are logged, not returned.
    pub async fn close(&self) -> Result<(), BusError> {
        let Some(connections) = self.request(|reply| Command::Close { reply }).await else {
            return Ok(());
        };
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(connection = %connection.key(), error = %e, "Close failed");
            }
        }
        info!("Router closed");
        Ok(())
    }

    /// True once the router task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// A registry port that does not keep the router alive, for components
    /// the router itself owns.
    #[must_use]
    pub fn registry(&self) -> RouterRegistry {
        RouterRegistry {
            commands: self.commands.downgrade(),
        }
    }
}

impl fmt::Debug for BusRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusRouter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl ConnectionRegistry for BusRouter {
    async fn add_connection(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<bool, RegistryError> {
        add_via(&self.commands, connection).await
    }
}

/// Weak [`ConnectionRegistry`] view of a [`BusRouter`].
#[derive(Clone)]
pub struct RouterRegistry {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterRegistry").finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionRegistry for RouterRegistry {
    async fn add_connection(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<bool, RegistryError> {
        let commands = self.commands.upgrade().ok_or(RegistryError::Closed)?;
        add_via(&commands, connection).await
    }
}
