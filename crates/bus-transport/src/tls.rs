//! # TLS Settings
//!
//! Optional rustls client and server configurations used by `ssl://`
//! connections and TLS listeners. The ring provider is selected explicitly so
//! no process-wide default has to be installed.

use crate::error::TransportError;
use crate::uri::ConnectionUri;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Byte stream the transports read and write, plain TCP or TLS.
pub(crate) trait BusStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BusStream for T {}

pub(crate) type BoxedStream = Box<dyn BusStream>;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

/// TLS material for the bus.
///
/// Empty by default; `ssl://` connections fail with
/// [`TransportError::TlsNotConfigured`] until a client config is supplied.
#[derive(Clone, Default)]
pub struct TlsSettings {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsSettings {
    /// No TLS material.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a prepared client configuration.
    #[must_use]
    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    /// Use a prepared server configuration.
    #[must_use]
    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Client configuration trusting exactly the given certificates.
    ///
    /// # Errors
    ///
    /// [`TransportError::Tls`] if a certificate is rejected.
    pub fn with_trusted_roots(
        self,
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Result<Self, TransportError> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert).map_err(tls_error)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(store)
            .with_no_client_auth();
        Ok(self.with_client_config(Arc::new(config)))
    }

    /// Server configuration presenting one certificate chain.
    ///
    /// # Errors
    ///
    /// [`TransportError::Tls`] if the key does not match the chain.
    pub fn with_server_identity(
        self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TransportError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(tls_error)?;
        Ok(self.with_server_config(Arc::new(config)))
    }

    /// True if outbound `ssl://` connections can be made.
    #[must_use]
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// True if listeners will wrap accepted sockets in TLS.
    #[must_use]
    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub(crate) fn connector(&self, uri: &ConnectionUri) -> Result<TlsConnector, TransportError> {
        self.client
            .clone()
            .map(TlsConnector::from)
            .ok_or_else(|| TransportError::TlsNotConfigured { uri: uri.clone() })
    }

    pub(crate) fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server.clone().map(TlsAcceptor::from)
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

pub(crate) fn server_name(uri: &ConnectionUri) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(uri.host().to_string()).map_err(tls_error)
}
