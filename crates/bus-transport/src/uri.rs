//! # Connection URIs
//!
//! `socket://host:port`, `ssl://host:port` and `multicast://group:port`.
//! IPv6 hosts are written in brackets: `socket://[::1]:8800`.

use crate::error::TransportError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;

/// URI scheme understood by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// Plain TCP.
    Socket,
    /// TLS over TCP.
    Ssl,
    /// UDP multicast discovery group.
    Multicast,
}

impl Scheme {
    /// Scheme name without the `://`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Ssl => "ssl",
            Self::Multicast => "multicast",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionUri {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ConnectionUri {
    /// Build a URI from parts. IPv6 hosts are given without brackets.
    #[must_use]
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// `socket://host:port`
    #[must_use]
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Socket, host, port)
    }

    /// `ssl://host:port`
    #[must_use]
    pub fn ssl(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Ssl, host, port)
    }

    /// `multicast://group:port`
    #[must_use]
    pub fn multicast(group: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Multicast, group, port)
    }

    /// Build from a resolved socket address.
    #[must_use]
    pub fn from_socket_addr(scheme: Scheme, addr: SocketAddr) -> Self {
        Self::new(scheme, addr.ip().to_string(), addr.port())
    }

    /// The scheme.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or address, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` suitable for `TcpStream::connect` and friends.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same host and port under another scheme.
    #[must_use]
    pub fn with_scheme(&self, scheme: Scheme) -> Self {
        Self::new(scheme, self.host.clone(), self.port)
    }

    /// The host as an IP address, if it is one.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for ConnectionUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidUri {
            uri: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme {
            "socket" => Scheme::Socket,
            "ssl" => Scheme::Ssl,
            "multicast" => Scheme::Multicast,
            other => {
                return Err(TransportError::UnsupportedScheme {
                    scheme: other.to_string(),
                })
            }
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 host"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        Ok(Self::new(scheme, host, port))
    }
}

/// Best guess at this machine's externally reachable address.
///
/// Asks the OS which local address would route to a documentation address;
/// no packet is sent. Falls back to loopback when there is no route.
#[must_use]
pub fn local_host_address() -> IpAddr {
    let lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };
    match lookup() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
