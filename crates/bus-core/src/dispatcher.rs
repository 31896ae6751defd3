//! # Local Dispatcher
//!
//! The in-process hub. `publish` runs every matching handler synchronously on
//! the caller and returns once all of them have returned.

use crate::message::BusMessage;
use crate::registry::{DispatchReport, MessageHandler, SubscriptionHandle, SubscriptionTable};
use crate::subscription::Subscription;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Synchronous publish/subscribe hub for one process.
#[derive(Debug, Default)]
pub struct LocalDispatcher {
    table: SubscriptionTable,
    published: AtomicU64,
}

impl LocalDispatcher {
    /// Create a dispatcher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for messages matching `subscription`.
    pub fn subscribe<H>(&self, subscription: Subscription, handler: H) -> SubscriptionHandle
    where
        H: MessageHandler + 'static,
    {
        self.table.register(subscription, handler)
    }

    /// Register an already shared handler.
    pub fn subscribe_arc(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.table.register_arc(subscription, handler)
    }

    /// Deliver a locally produced message.
    pub fn publish(&self, msg: BusMessage) -> DispatchReport {
        self.published.fetch_add(1, Ordering::Relaxed);
        let report = self.table.dispatch(&msg);
        trace!(
            message_id = msg.message_id().unwrap_or("-"),
            from_peer = msg.is_from_peer(),
            matched = report.matched,
            "Message published"
        );
        report
    }

    /// Deliver a message that just arrived from a remote peer.
    ///
    /// The message is tagged so the router never sends it back out. Only the
    /// router's inbound path calls this; applications use [`Self::publish`].
    #[doc(hidden)]
    pub fn publish_ingested(&self, msg: BusMessage) -> DispatchReport {
        self.publish(msg.into_ingested())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.table.len()
    }

    /// Total messages published since creation.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BusMessageBuilder;
    use crate::registry::HandlerResult;
    use parking_lot::Mutex;

    #[test]
    fn test_publish_no_subscribers() {
        let dispatcher = LocalDispatcher::new();
        let report = dispatcher.publish(BusMessageBuilder::new().build());
        assert_eq!(report.matched, 0);
        assert_eq!(dispatcher.messages_published(), 1);
    }

    #[test]
    fn test_handlers_run_before_publish_returns() {
        let dispatcher = LocalDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = dispatcher.subscribe(Subscription::source("here"), move |m: &BusMessage| -> HandlerResult {
            s.lock().push(m.message_id().unwrap_or_default().to_string());
            Ok(())
        });

        for id in ["1", "2", "3"] {
            dispatcher.publish(
                BusMessageBuilder::new()
                    .set_message_id(id)
                    .set_message_source("here")
                    .build(),
            );
            assert_eq!(seen.lock().last().map(String::as_str), Some(id));
        }
        assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_publish_ingested_tags_origin() {
        let dispatcher = LocalDispatcher::new();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&origins);
        let _sub = dispatcher.subscribe(Subscription::all(), move |m: &BusMessage| -> HandlerResult {
            o.lock().push(m.is_from_peer());
            Ok(())
        });

        dispatcher.publish(BusMessageBuilder::new().build());
        dispatcher.publish_ingested(BusMessageBuilder::new().build());

        assert_eq!(*origins.lock(), vec![false, true]);
    }

    #[test]
    fn test_subscriber_count_tracks_handles() {
        let dispatcher = LocalDispatcher::new();
        let a = dispatcher.subscribe(Subscription::all(), |_: &BusMessage| -> HandlerResult { Ok(()) });
        let mut b = dispatcher.subscribe(Subscription::message_type("X"), |_: &BusMessage| -> HandlerResult { Ok(()) });
        assert_eq!(dispatcher.subscriber_count(), 2);

        b.close();
        assert_eq!(dispatcher.subscriber_count(), 1);
        drop(a);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
