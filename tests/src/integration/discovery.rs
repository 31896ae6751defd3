//! # Discovery Flows
//!
//! A discoverable bus announces its server on a multicast group; a bus
//! discovering that service connects to it, and reconnects after the link is
//! dropped. The flows driven by real multicast traffic need a network
//! interface that loops multicast back; the announcement handling itself is
//! exercised without one by feeding datagrams to the listener directly.

#[cfg(test)]
mod tests {
    use super::super::support::{
        eventually, listening_bus, wait_for_peers, Inbox, DELIVERY_TIMEOUT,
    };
    use bus_core::{BusMessageBuilder, CodecKind};
    use bus_discovery::{Announcement, DiscoveryConfig, DiscoveryListener};
    use bus_runtime::{Bus, BusBuilder};
    use bus_transport::{
        ConnectionKey, ConnectionKind, ConnectionUri, TlsSettings, TransportConfig,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    /// Beacon interval plus listener timeout, with slack.
    const CONVERGENCE: Duration = Duration::from_secs(3);

    async fn discoverable(service: &str, group: &ConnectionUri) -> Bus {
        let bus = BusBuilder::new()
            .with_discovery_config(DiscoveryConfig::for_testing())
            .listen_on(ConnectionUri::socket("127.0.0.1", 0))
            .discoverable(service, group.clone())
            .build()
            .unwrap();
        bus.start().await.unwrap();
        bus
    }

    async fn discovering(services: &[&str], group: &ConnectionUri) -> Bus {
        let mut builder =
            BusBuilder::new().with_discovery_config(DiscoveryConfig::for_testing());
        for service in services {
            builder = builder.discover_and_connect(*service, group.clone());
        }
        let bus = builder.build().unwrap();
        bus.start().await.unwrap();
        bus
    }

    /// Discovered client connections of `bus`.
    async fn discovered(bus: &Bus) -> Vec<ConnectionKey> {
        bus.router()
            .connections()
            .await
            .into_iter()
            .filter(|key| key.kind == ConnectionKind::Client)
            .collect()
    }

    async fn wait_for_discovered(bus: &Bus, expected: &ConnectionUri) -> ConnectionKey {
        let deadline = tokio::time::Instant::now() + CONVERGENCE;
        loop {
            let keys = discovered(bus).await;
            if let Some(key) = keys.iter().find(|key| &key.uri == expected) {
                assert_eq!(keys.len(), 1, "more than one connection: {keys:?}");
                return key.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{expected} not discovered within {CONVERGENCE:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_announcement_datagrams_drive_router() {
        let (a, port) = listening_bus().await;
        let b = BusBuilder::new().build().unwrap();
        b.start().await.unwrap();

        let listener = DiscoveryListener::with_settings(
            ConnectionUri::multicast("239.255.77.4", 50_104),
            ["prices"],
            Arc::new(b.router().registry()),
            DiscoveryConfig::for_testing(),
            TransportConfig::for_testing(),
            TlsSettings::default(),
        )
        .unwrap();
        let address = ConnectionUri::socket("127.0.0.1", port);
        let from: SocketAddr = ([127, 0, 0, 1], 50_104).into();
        let announce = |service: &str| {
            Announcement::new(service, address.clone(), CodecKind::Standard)
                .encode()
                .unwrap()
        };

        // Other services and garbage change nothing
        listener.handle_datagram(&announce("news"), from).await;
        listener.handle_datagram(b"not a frame", from).await;
        assert!(discovered(&b).await.is_empty());

        listener.handle_datagram(&announce("prices"), from).await;
        let key = wait_for_discovered(&b, &address).await;
        assert!(listener.is_tracked(&address));
        wait_for_peers(&a, 1).await;

        // A repeated announcement for a tracked address is ignored
        listener.handle_datagram(&announce("prices"), from).await;
        assert_eq!(discovered(&b).await.len(), 1);

        let (b_inbox, _b) = Inbox::attach(&b);
        a.publish(BusMessageBuilder::new().set_message_id("direct").build());
        b_inbox.expect_from_peer("direct").await;

        // Dropping the connection untracks the address; the next
        // announcement connects again
        assert!(b.router().remove_connection(&key).await.unwrap());
        let untracked = eventually(DELIVERY_TIMEOUT, || {
            (!listener.is_tracked(&address)).then_some(())
        })
        .await;
        assert!(untracked.is_some(), "{address} still tracked");
        wait_for_peers(&a, 0).await;

        listener.handle_datagram(&announce("prices"), from).await;
        wait_for_discovered(&b, &address).await;
        wait_for_peers(&a, 1).await;
        a.publish(BusMessageBuilder::new().set_message_id("redirect").build());
        b_inbox.expect_from_peer("redirect").await;

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a multicast-capable network interface"]
    async fn test_listener_connects_to_announced_server() {
        let group = ConnectionUri::multicast("239.255.77.1", 50_101);
        let a = discoverable("prices", &group).await;
        let b = discovering(&["prices"], &group).await;
        let advertised = a.servers()[0].advertised_uri();

        wait_for_discovered(&b, &advertised).await;
        wait_for_peers(&a, 1).await;

        // Repeated announcements do not add connections
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(discovered(&b).await.len(), 1);
        assert_eq!(a.servers()[0].peer_count(), 1);

        let (b_inbox, _b) = Inbox::attach(&b);
        a.publish(BusMessageBuilder::new().set_message_id("hello").build());
        b_inbox.expect_from_peer("hello").await;

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a multicast-capable network interface"]
    async fn test_rediscovery_after_connection_dropped() {
        let group = ConnectionUri::multicast("239.255.77.2", 50_102);
        let a = discoverable("prices", &group).await;
        let b = discovering(&["prices"], &group).await;
        let advertised = a.servers()[0].advertised_uri();

        let key = wait_for_discovered(&b, &advertised).await;
        assert!(b.router().remove_connection(&key).await.unwrap());

        wait_for_discovered(&b, &advertised).await;
        let (b_inbox, _b) = Inbox::attach(&b);
        wait_for_peers(&a, 1).await;
        a.publish(BusMessageBuilder::new().set_message_id("again").build());
        b_inbox.expect_from_peer("again").await;

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a multicast-capable network interface"]
    async fn test_uninteresting_service_is_ignored() {
        let group = ConnectionUri::multicast("239.255.77.3", 50_103);
        let a = discoverable("news", &group).await;
        let b = discovering(&["prices"], &group).await;

        tokio::time::sleep(CONVERGENCE).await;
        assert!(discovered(&b).await.is_empty());
        assert_eq!(a.servers()[0].peer_count(), 0);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }
}
