//! # Bus Builder
//!
//! ```rust,ignore
//! let bus = BusBuilder::new()
//!     .listen_on_port(8800)
//!     .discoverable("prices", "multicast://239.1.1.100:50100".parse()?)
//!     .discover_and_connect("quotes", "multicast://239.1.1.100:50100".parse()?)
//!     .build()?;
//! bus.start().await?;
//! ```

use crate::bus::Bus;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::router::BusRouter;
use bus_core::{LocalDispatcher, WireCodec};
use bus_discovery::{DiscoveryBeacon, DiscoveryConfig, DiscoveryListener};
use bus_transport::{
    local_host_address, ConnectionUri, SocketClient, SocketServer, TlsSettings, TransportConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Collects the connections of a bus.
#[derive(Debug, Clone)]
pub struct BusBuilder {
    codec: WireCodec,
    listen: Vec<ConnectionUri>,
    connect: Vec<ConnectionUri>,
    discoverable: Vec<(String, ConnectionUri)>,
    discover: Vec<(String, ConnectionUri)>,
    transport: TransportConfig,
    discovery: DiscoveryConfig,
    tls: TlsSettings,
    service: Option<String>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBuilder {
    /// Empty builder using the STANDARD codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            codec: WireCodec::standard(),
            listen: Vec::new(),
            connect: Vec::new(),
            discoverable: Vec::new(),
            discover: Vec::new(),
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
            tls: TlsSettings::default(),
            service: None,
        }
    }

    /// Builder pre-filled from configuration.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        let mut builder = Self::new()
            .with_service_name(config.service.clone())
            .with_codec(WireCodec::new(config.codec))
            .with_transport_config(config.transport.clone())
            .with_discovery_config(config.discovery.clone());
        builder.listen.extend(config.listen.iter().cloned());
        builder.connect.extend(config.connect.iter().cloned());
        for sg in &config.discoverable {
            builder = builder.discoverable(sg.service.clone(), sg.group.clone());
        }
        for sg in &config.discover {
            builder = builder.discover_and_connect(sg.service.clone(), sg.group.clone());
        }
        builder
    }

    /// Codec for servers and static connections. Discovered connections use
    /// the codec their peer announces.
    #[must_use]
    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Name preset as `_src` by [`Bus::message_builder`].
    #[must_use]
    pub fn with_service_name(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    #[must_use]
    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery = config;
        self
    }

    /// TLS material for `ssl://` servers and clients.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Accept peers on `uri` (`socket://` or `ssl://`).
    #[must_use]
    pub fn listen_on(mut self, uri: ConnectionUri) -> Self {
        self.listen.push(uri);
        self
    }

    /// Accept peers on `port` at this machine's address.
    #[must_use]
    pub fn listen_on_port(self, port: u16) -> Self {
        let host = local_host_address().to_string();
        self.listen_on(ConnectionUri::socket(host, port))
    }

    /// Connect to a peer over TCP.
    #[must_use]
    pub fn connect_to(self, host: impl Into<String>, port: u16) -> Self {
        self.connect_to_uri(ConnectionUri::socket(host, port))
    }

    /// Connect to a peer over TLS.
    #[must_use]
    pub fn connect_to_ssl(self, host: impl Into<String>, port: u16) -> Self {
        self.connect_to_uri(ConnectionUri::ssl(host, port))
    }

    #[must_use]
    pub fn connect_to_uri(mut self, uri: ConnectionUri) -> Self {
        self.connect.push(uri);
        self
    }

    /// Announce the first listening server as `service` on `group`.
    #[must_use]
    pub fn discoverable(mut self, service: impl Into<String>, group: ConnectionUri) -> Self {
        self.discoverable.push((service.into(), group));
        self
    }

    /// Connect to every peer announcing `service` on `group`.
    #[must_use]
    pub fn discover_and_connect(
        mut self,
        service: impl Into<String>,
        group: ConnectionUri,
    ) -> Self {
        self.discover.push((service.into(), group));
        self
    }

    /// Create every connection and register it with a new, unstarted router.
    ///
    /// # Errors
    ///
    /// [`BusError::NoRuntime`] outside a Tokio runtime, a transport or
    /// discovery error for an unusable URI, or [`BusError::NotListening`]
    /// for `discoverable` without `listen_on`.
    pub fn build(self) -> Result<Bus, BusError> {
        let dispatcher = Arc::new(LocalDispatcher::new());
        let router = BusRouter::new(&dispatcher)?;

        let mut servers = Vec::with_capacity(self.listen.len());
        for uri in self.listen {
            let server = SocketServer::with_settings(
                uri,
                self.codec.clone(),
                self.transport.clone(),
                self.tls.clone(),
            )?;
            router.register(Arc::new(server.clone()));
            servers.push(server);
        }

        for uri in self.connect {
            let client = SocketClient::with_settings(
                uri,
                self.codec.clone(),
                self.transport.clone(),
                self.tls.clone(),
            )?;
            router.register(Arc::new(client));
        }

        for (service, group) in self.discoverable {
            let Some(server) = servers.first() else {
                return Err(BusError::NotListening { service });
            };
            let beacon =
                DiscoveryBeacon::for_server(service, group, server, self.discovery.clone())?;
            router.register(Arc::new(beacon));
        }

        // One listener per group, interested in every service asked for there
        let mut groups: BTreeMap<ConnectionUri, Vec<String>> = BTreeMap::new();
        for (service, group) in self.discover {
            groups.entry(group).or_default().push(service);
        }
        for (group, services) in groups {
            let listener = DiscoveryListener::with_settings(
                group,
                services,
                Arc::new(router.registry()),
                self.discovery.clone(),
                self.transport.clone(),
                self.tls.clone(),
            )?;
            router.register(Arc::new(listener));
        }

        info!(
            servers = servers.len(),
            codec = %self.codec.kind(),
            "Bus assembled"
        );
        Ok(Bus::new(dispatcher, router, servers, self.service))
    }
}
