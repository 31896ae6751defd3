//! # Subscription Registry
//!
//! The table of `(subscription, handler)` registrations shared by the local
//! dispatcher and by every transport's inbound side. Dispatch iterates a
//! snapshot, so handlers may subscribe or close handles re-entrantly without
//! deadlocking.

use crate::message::BusMessage;
use crate::subscription::Subscription;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a handler can report back to the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler refused or failed to process the message.
    #[error("handler rejected message: {0}")]
    Rejected(String),

    /// The handler panicked; the panic was contained.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Result type returned by message handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Receives messages matching a subscription.
///
/// Handlers run on the publishing thread. They should hand long work off
/// elsewhere; a slow handler delays the publisher and every later handler.
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    fn on_message(&self, msg: &BusMessage) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&BusMessage) -> HandlerResult + Send + Sync,
{
    fn on_message(&self, msg: &BusMessage) -> HandlerResult {
        self(msg)
    }
}

/// Identifies one registration inside a [`SubscriptionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers whose subscription matched.
    pub matched: usize,
    /// Matched handlers that returned an error or panicked.
    pub failed: usize,
}

impl DispatchReport {
    /// Handlers that completed successfully.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.matched - self.failed
    }
}

type Entry = (Subscription, Arc<dyn MessageHandler>);

struct TableInner {
    entries: RwLock<BTreeMap<SubscriptionId, Entry>>,
    next_id: AtomicU64,
}

/// Concurrent registry of subscriptions and their handlers.
///
/// Cloning shares the same table.
#[derive(Clone)]
pub struct SubscriptionTable {
    inner: Arc<TableInner>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler. The returned handle removes it again.
    pub fn register<H>(&self, subscription: Subscription, handler: H) -> SubscriptionHandle
    where
        H: MessageHandler + 'static,
    {
        self.register_arc(subscription, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn register_arc(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(id = %id, subscription = %subscription, "Subscription registered");
        self.inner.entries.write().insert(id, (subscription, handler));
        SubscriptionHandle {
            id: Some(id),
            table: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Deliver a message to every matching handler.
    ///
    /// Runs on the caller and returns once every matching handler has
    /// returned. Registrations added or removed during dispatch may or may
    /// not see this message. Handler errors and panics are contained and
    /// counted; delivery to the remaining handlers continues.
    pub fn dispatch(&self, msg: &BusMessage) -> DispatchReport {
        let snapshot: Vec<(SubscriptionId, Arc<dyn MessageHandler>)> = {
            let entries = self.inner.entries.read();
            entries
                .iter()
                .filter(|(_, (sub, _))| sub.matches(msg))
                .map(|(id, (_, handler))| (*id, Arc::clone(handler)))
                .collect()
        };

        let mut report = DispatchReport {
            matched: snapshot.len(),
            failed: 0,
        };

        for (id, handler) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_message(msg)))
                .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&payload))));

            if let Err(e) = outcome {
                report.failed += 1;
                warn!(
                    id = %id,
                    message_id = msg.message_id().unwrap_or("-"),
                    error = %e,
                    "Message handler failed"
                );
            }
        }

        report
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("registrations", &self.len())
            .finish()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owns one registration.
///
/// Closing (or dropping) the handle removes the registration from the table
/// that created it. Closing twice is a no-op, and a handle outliving its
/// table closes silently.
#[must_use = "dropping a SubscriptionHandle removes the subscription"]
pub struct SubscriptionHandle {
    id: Option<SubscriptionId>,
    table: Weak<TableInner>,
}

impl SubscriptionHandle {
    /// A handle that is already closed and owns nothing.
    pub fn closed() -> Self {
        Self {
            id: None,
            table: Weak::new(),
        }
    }

    /// The registration this handle owns, until closed.
    #[must_use]
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// True once the registration has been removed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.id.is_none()
    }

    /// Remove the registration. Idempotent.
    pub fn close(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(table) = self.table.upgrade() {
            table.entries.write().remove(&id);
            debug!(id = %id, "Subscription closed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}
