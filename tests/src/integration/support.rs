//! Shared fixtures for the integration flows.

use bus_core::{BusMessage, HandlerResult, Subscription, SubscriptionHandle};
use bus_runtime::{Bus, BusBuilder};
use bus_transport::ConnectionUri;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything that should happen "soon".
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to watch for something that must not happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Records every message a subscription sees.
#[derive(Clone, Default)]
pub struct Inbox {
    messages: Arc<Mutex<Vec<BusMessage>>>,
}

impl Inbox {
    /// Subscribe a new inbox to everything on `bus`.
    pub fn attach(bus: &Bus) -> (Self, SubscriptionHandle) {
        Self::subscribe(bus, Subscription::all())
    }

    /// Subscribe a new inbox to the messages `subscription` matches.
    pub fn subscribe(bus: &Bus, subscription: Subscription) -> (Self, SubscriptionHandle) {
        let inbox = Self::default();
        let sink = Arc::clone(&inbox.messages);
        let handle = bus.subscribe(subscription, move |msg: &BusMessage| -> HandlerResult {
            sink.lock().push(msg.clone());
            Ok(())
        });
        (inbox, handle)
    }

    pub fn snapshot(&self) -> Vec<BusMessage> {
        self.messages.lock().clone()
    }

    /// Messages that arrived from a peer.
    pub fn from_peers(&self) -> Vec<BusMessage> {
        self.snapshot()
            .into_iter()
            .filter(BusMessage::is_from_peer)
            .collect()
    }

    /// Wait for a peer message with the given id.
    pub async fn expect_from_peer(&self, id: &str) -> BusMessage {
        self.expect_from_peer_within(id, DELIVERY_TIMEOUT).await
    }

    pub async fn expect_from_peer_within(&self, id: &str, limit: Duration) -> BusMessage {
        let found = eventually(limit, || {
            self.from_peers()
                .into_iter()
                .find(|msg| msg.message_id() == Some(id))
        })
        .await;
        match found {
            Some(msg) => msg,
            None => panic!("message {id} not received within {limit:?}"),
        }
    }

    /// Number of peer messages with the given id.
    pub fn count_from_peers(&self, id: &str) -> usize {
        self.from_peers()
            .iter()
            .filter(|msg| msg.message_id() == Some(id))
            .count()
    }

    /// Assert no peer message with the given id shows up.
    pub async fn expect_no_peer_message(&self, id: &str) {
        tokio::time::sleep(QUIET_PERIOD).await;
        assert_eq!(self.count_from_peers(id), 0, "unexpected peer message {id}");
    }
}

/// Poll `check` until it yields a value or `limit` passes.
pub async fn eventually<T>(limit: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A started bus listening on an ephemeral loopback port.
pub async fn listening_bus() -> (Bus, u16) {
    let bus = BusBuilder::new()
        .listen_on(ConnectionUri::socket("127.0.0.1", 0))
        .build()
        .unwrap();
    bus.start().await.unwrap();
    let port = bus.servers()[0].local_addr().unwrap().port();
    (bus, port)
}

/// A started bus connected to `127.0.0.1:port`.
pub async fn connected_bus(port: u16) -> Bus {
    let bus = BusBuilder::new()
        .connect_to("127.0.0.1", port)
        .build()
        .unwrap();
    bus.start().await.unwrap();
    bus
}

/// Wait until the first server of `bus` has `expected` peers.
pub async fn wait_for_peers(bus: &Bus, expected: usize) {
    let server = &bus.servers()[0];
    let reached = eventually(DELIVERY_TIMEOUT, || {
        (server.peer_count() == expected).then_some(())
    })
    .await;
    assert!(
        reached.is_some(),
        "server has {} peers, expected {expected}",
        server.peer_count()
    );
}

/// Attributes of `msg` as an owned map.
pub fn attributes(msg: &BusMessage) -> HashMap<String, String> {
    msg.to_attributes()
}
