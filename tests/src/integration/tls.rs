//! # TLS Flow
//!
//! `ssl://` servers and clients with a self-signed certificate for
//! `localhost`, plus the AES codec over TLS.

#[cfg(test)]
mod tests {
    use super::super::support::{wait_for_peers, Inbox};
    use bus_core::{BusMessageBuilder, WireCodec};
    use bus_runtime::{Bus, BusBuilder, BusError};
    use bus_transport::{
        CertificateDer, ConnectionKind, ConnectionUri, PrivateKeyDer, TlsSettings, TransportError,
    };

    fn self_signed() -> TlsSettings {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        TlsSettings::new()
            .with_trusted_roots([cert_der.clone()])
            .unwrap()
            .with_server_identity(vec![cert_der], key_der)
            .unwrap()
    }

    async fn ssl_server(tls: &TlsSettings, codec: WireCodec) -> (Bus, u16) {
        let bus = BusBuilder::new()
            .with_codec(codec)
            .with_tls(tls.clone())
            .listen_on(ConnectionUri::ssl("127.0.0.1", 0))
            .build()
            .unwrap();
        bus.start().await.unwrap();
        let port = bus.servers()[0].local_addr().unwrap().port();
        (bus, port)
    }

    #[tokio::test]
    async fn test_messages_cross_tls_link() {
        let tls = self_signed();
        let (a, port) = ssl_server(&tls, WireCodec::standard()).await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let b = BusBuilder::new()
            .with_tls(tls)
            .connect_to_ssl("localhost", port)
            .build()
            .unwrap();
        b.start().await.unwrap();
        let (b_inbox, _b) = Inbox::attach(&b);
        wait_for_peers(&a, 1).await;

        b.publish(BusMessageBuilder::new().set_message_id("up").build());
        a.publish(BusMessageBuilder::new().set_message_id("down").build());

        a_inbox.expect_from_peer("up").await;
        b_inbox.expect_from_peer("down").await;

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_aes_codec_over_tls() {
        let tls = self_signed();
        let codec = WireCodec::aes_with_key([7u8; 16]);
        let (a, port) = ssl_server(&tls, codec.clone()).await;
        let (a_inbox, _a) = Inbox::attach(&a);
        let b = BusBuilder::new()
            .with_codec(codec)
            .with_tls(tls)
            .connect_to_ssl("localhost", port)
            .build()
            .unwrap();
        b.start().await.unwrap();

        let msg = BusMessageBuilder::new()
            .set_message_id("secret")
            .set_attribute("body", "line one")
            .unwrap()
            .build();
        b.publish(msg);

        let received = a_inbox.expect_from_peer("secret").await;
        assert_eq!(received.get("body"), Some("line one"));

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ssl_client_without_roots_fails_start() {
        let (a, port) = ssl_server(&self_signed(), WireCodec::standard()).await;
        let b = BusBuilder::new()
            .connect_to_ssl("localhost", port)
            .build()
            .unwrap();

        let err = b.start().await.unwrap_err();
        let BusError::PartialStart { failed } = err else {
            panic!("expected PartialStart, got {err:?}");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.kind, ConnectionKind::Client);
        assert!(matches!(failed[0].1, TransportError::TlsNotConfigured { .. }));
        assert!(b.router().connections().await.is_empty());

        b.close().await.unwrap();
        a.close().await.unwrap();
    }
}
