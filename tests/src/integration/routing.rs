//! # Routing Flows
//!
//! Loop prevention between federated buses, idempotent registration, and
//! broadcast isolation from a stalled peer.

#[cfg(test)]
mod tests {
    use super::super::support::{
        connected_bus, listening_bus, wait_for_peers, Inbox, DELIVERY_TIMEOUT, QUIET_PERIOD,
    };
    use bus_core::{BusMessageBuilder, Subscription, WireCodec};
    use bus_runtime::BusBuilder;
    use bus_transport::{ConnectionUri, SocketClient};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::net::TcpStream;

    fn client(port: u16) -> Arc<SocketClient> {
        Arc::new(
            SocketClient::new(ConnectionUri::socket("127.0.0.1", port), WireCodec::standard())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ingested_messages_are_not_forwarded() {
        let (a, port) = listening_bus().await;
        let b = connected_bus(port).await;
        let c = connected_bus(port).await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let (b_inbox, _b) = Inbox::attach(&b);
        let (c_inbox, _c) = Inbox::attach(&c);
        wait_for_peers(&a, 2).await;

        b.publish(BusMessageBuilder::new().set_message_id("from-b").build());

        a_inbox.expect_from_peer("from-b").await;
        // A must not relay what it ingested, not even to the sender
        c_inbox.expect_no_peer_message("from-b").await;
        b_inbox.expect_no_peer_message("from-b").await;

        // C is connected: A's own messages do reach it
        a.publish(BusMessageBuilder::new().set_message_id("from-a").build());
        c_inbox.expect_from_peer("from-a").await;

        for bus in [c, b, a] {
            bus.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_federated_cycle_does_not_loop() {
        let (a, a_port) = listening_bus().await;
        let (b, b_port) = listening_bus().await;
        // A and B connect to each other, closing a cycle
        assert!(a.router().add_connection(client(b_port)).await.unwrap());
        assert!(b.router().add_connection(client(a_port)).await.unwrap());
        wait_for_peers(&a, 1).await;
        wait_for_peers(&b, 1).await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let (b_inbox, _b) = Inbox::attach(&b);

        b.publish(BusMessageBuilder::new().set_message_id("cycle").build());

        // One copy over each of the two links, then silence
        a_inbox.expect_from_peer("cycle").await;
        tokio::time::sleep(QUIET_PERIOD).await;
        assert_eq!(a_inbox.count_from_peers("cycle"), 2);
        assert_eq!(b_inbox.count_from_peers("cycle"), 0);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_equal_uri_registered_once() {
        let (a, port) = listening_bus().await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let b = BusBuilder::new().build().unwrap();
        b.start().await.unwrap();

        assert!(b.router().add_connection(client(port)).await.unwrap());
        assert!(!b.router().add_connection(client(port)).await.unwrap());
        assert_eq!(b.router().connections().await.len(), 1);

        wait_for_peers(&a, 1).await;
        tokio::time::sleep(QUIET_PERIOD).await;
        assert_eq!(a.servers()[0].peer_count(), 1);

        b.publish(BusMessageBuilder::new().set_message_id("once").build());
        a_inbox.expect_from_peer("once").await;
        tokio::time::sleep(QUIET_PERIOD).await;
        assert_eq!(a_inbox.count_from_peers("once"), 1);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_connection_stops_delivery() {
        let (a, port) = listening_bus().await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let b = connected_bus(port).await;
        wait_for_peers(&a, 1).await;

        let keys = b.router().connections().await;
        assert_eq!(keys.len(), 1);
        assert!(b.router().remove_connection(&keys[0]).await.unwrap());
        assert!(!b.router().remove_connection(&keys[0]).await.unwrap());
        wait_for_peers(&a, 0).await;

        b.publish(BusMessageBuilder::new().set_message_id("gone").build());
        a_inbox.expect_no_peer_message("gone").await;

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_healthy_peer() {
        const FILLER_FRAMES: usize = 64;
        const FILLER_BYTES: usize = 256 * 1024;

        let (a, port) = listening_bus().await;
        // Connects but never reads
        let _stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let healthy = connected_bus(port).await;
        let (markers, _m) = Inbox::subscribe(&healthy, Subscription::message_type("MARKER"));
        wait_for_peers(&a, 2).await;

        // Far more than the stalled socket's buffers can absorb
        let filler = "x".repeat(FILLER_BYTES);
        let began = Instant::now();
        for i in 0..FILLER_FRAMES {
            let msg = BusMessageBuilder::new()
                .set_message_id(i.to_string())
                .set_message_type("FILLER")
                .set_attribute("payload", filler.as_str())
                .unwrap()
                .build();
            a.publish(msg);
        }
        let marker = BusMessageBuilder::new()
            .set_message_id("marker")
            .set_message_type("MARKER")
            .build();
        a.publish(marker);
        assert!(
            began.elapsed() < DELIVERY_TIMEOUT,
            "publish waited on the network"
        );

        markers
            .expect_from_peer_within("marker", Duration::from_secs(10))
            .await;
        assert_eq!(a.servers()[0].peer_count(), 2);

        healthy.close().await.unwrap();
        a.close().await.unwrap();
    }
}
