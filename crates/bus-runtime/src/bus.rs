//! # Bus Handle
//!
//! The handle applications hold. Publishing and subscribing go through the
//! local dispatcher; the router behind it forwards locally published
//! messages to peers and feeds peer messages back in.

use crate::error::BusError;
use crate::router::BusRouter;
use bus_core::{
    BusMessage, BusMessageBuilder, DispatchReport, LocalDispatcher, MessageHandler, Subscription,
    SubscriptionHandle,
};
use bus_transport::SocketServer;
use std::fmt;
use std::sync::Arc;

/// An assembled bus: local dispatcher plus the router owning its
/// connections. Built by [`crate::BusBuilder`].
pub struct Bus {
    dispatcher: Arc<LocalDispatcher>,
    router: BusRouter,
    servers: Vec<SocketServer>,
    service: Option<String>,
}

impl Bus {
    pub(crate) fn new(
        dispatcher: Arc<LocalDispatcher>,
        router: BusRouter,
        servers: Vec<SocketServer>,
        service: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            router,
            servers,
            service,
        }
    }

    /// A fresh message builder, with `_src` preset to the service name when
    /// the bus has one.
    #[must_use]
    pub fn message_builder(&self) -> BusMessageBuilder {
        let mut builder = BusMessageBuilder::new();
        if let Some(service) = &self.service {
            builder.set_message_source(service.clone());
        }
        builder
    }

    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Deliver to local subscribers now and, once started, to every peer.
    pub fn publish(&self, msg: BusMessage) -> DispatchReport {
        self.dispatcher.publish(msg)
    }

    /// Receive local and peer messages matching `subscription`.
    pub fn subscribe<H>(&self, subscription: Subscription, handler: H) -> SubscriptionHandle
    where
        H: MessageHandler + 'static,
    {
        self.dispatcher.subscribe(subscription, handler)
    }

    #[must_use]
    pub fn router(&self) -> &BusRouter {
        &self.router
    }

    /// Servers this bus listens on, in `listen_on` order.
    #[must_use]
    pub fn servers(&self) -> &[SocketServer] {
        &self.servers
    }

    /// Start routing and open every connection.
    ///
    /// # Errors
    ///
    /// See [`BusRouter::start`].
    pub async fn start(&self) -> Result<(), BusError> {
        self.router.start().await
    }

    /// Stop routing and close every connection. Local subscriptions stay.
    ///
    /// # Errors
    ///
    /// See [`BusRouter::close`].
    pub async fn close(&self) -> Result<(), BusError> {
        self.router.close().await
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.dispatcher.subscriber_count())
            .field("servers", &self.servers.len())
            .field("service", &self.service)
            .field("router", &self.router)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::BusBuilder;
    use bus_core::{BusMessage, HandlerResult, Subscription};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_message_builder_presets_source() {
        let bus = BusBuilder::new().with_service_name("prices").build().unwrap();
        assert_eq!(bus.service_name(), Some("prices"));
        let msg = bus.message_builder().set_message_id("1").build();
        assert_eq!(msg.source(), Some("prices"));

        let msg = bus
            .message_builder()
            .set_message_source("override")
            .build();
        assert_eq!(msg.source(), Some("override"));

        let anonymous = BusBuilder::new().build().unwrap();
        assert_eq!(anonymous.message_builder().build().source(), None);
    }

    #[tokio::test]
    async fn test_published_messages_are_local() {
        let bus = BusBuilder::new().build().unwrap();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&origins);
        let _sub = bus.subscribe(Subscription::all(), move |m: &BusMessage| -> HandlerResult {
            o.lock().push(m.is_from_peer());
            Ok(())
        });

        let report = bus.publish(bus.message_builder().set_message_id("1").build());
        assert_eq!(report.matched, 1);
        assert_eq!(*origins.lock(), vec![false]);
    }
}
