//! # End-to-End Flow
//!
//! Bus A listens, bus B connects, and messages published on either side reach
//! the other with their attributes intact.

#[cfg(test)]
mod tests {
    use super::super::support::{attributes, connected_bus, listening_bus, wait_for_peers, Inbox};
    use bus_core::{BusMessageBuilder, Subscription};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_client_publish_reaches_server_subscriber() {
        let (a, port) = listening_bus().await;
        let (inbox, _handle) = Inbox::attach(&a);
        let b = connected_bus(port).await;

        let msg = b
            .message_builder()
            .set_message_id("1")
            .set_message_source("here")
            .set_message_destination("there")
            .build();
        b.publish(msg);

        let received = inbox.expect_from_peer("1").await;
        let expected: HashMap<String, String> = [
            ("_id", "1"),
            ("_src", "here"),
            ("_dst", "there"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(attributes(&received), expected);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_publish_reaches_client_subscriber() {
        let (a, port) = listening_bus().await;
        let b = connected_bus(port).await;
        let (inbox, _handle) = Inbox::attach(&b);
        wait_for_peers(&a, 1).await;

        let msg = BusMessageBuilder::new()
            .set_message_id("7")
            .set_message_type("PRICE")
            .set_attribute("symbol", "ABC")
            .unwrap()
            .build();
        a.publish(msg);

        let received = inbox.expect_from_peer("7").await;
        assert_eq!(received.message_type(), Some("PRICE"));
        assert_eq!(received.get("symbol"), Some("ABC"));

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_subscribers_see_publish_before_it_returns() {
        let (a, _port) = listening_bus().await;
        let (inbox, _handle) = Inbox::attach(&a);

        a.publish(BusMessageBuilder::new().set_message_id("local").build());

        let seen = inbox.snapshot();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].is_from_peer());
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_subscription_filters_peer_traffic() {
        let (a, port) = listening_bus().await;
        let (all, _all_handle) = Inbox::attach(&a);
        let (prices, _typed) = Inbox::subscribe(&a, Subscription::message_type("PRICE"));
        let b = connected_bus(port).await;

        for (id, message_type) in [("1", "NEWS"), ("2", "PRICE")] {
            let msg = BusMessageBuilder::new()
                .set_message_id(id)
                .set_message_type(message_type)
                .build();
            b.publish(msg);
        }

        all.expect_from_peer("2").await;
        let typed = prices.from_peers();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].message_id(), Some("2"));

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_bus_stops_forwarding() {
        let (a, port) = listening_bus().await;
        let (inbox, _handle) = Inbox::attach(&a);
        let b = connected_bus(port).await;
        wait_for_peers(&a, 1).await;

        b.close().await.unwrap();
        b.publish(BusMessageBuilder::new().set_message_id("late").build());

        inbox.expect_no_peer_message("late").await;
        a.close().await.unwrap();
    }
}
