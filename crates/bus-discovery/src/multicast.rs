//! # Multicast Sockets
//!
//! Group address parsing and the two socket shapes discovery needs: a
//! listener bound to the group port with address reuse, and an ephemeral
//! sender with TTL and loopback applied.

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use bus_transport::{ConnectionUri, Scheme};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Resolve a `multicast://group:port` URI to the group socket address.
///
/// The group must be an IP literal. Host names are rejected rather than
/// looked up, so a group never depends on DNS.
///
/// # Errors
///
/// [`DiscoveryError::NotMulticast`] if the scheme is wrong or the host is
/// not a multicast IP literal.
pub fn group_addr(uri: &ConnectionUri) -> Result<SocketAddr, DiscoveryError> {
    match uri.ip() {
        Some(ip) if uri.scheme() == Scheme::Multicast && ip.is_multicast() => {
            Ok(SocketAddr::new(ip, uri.port()))
        }
        _ => Err(DiscoveryError::NotMulticast { uri: uri.clone() }),
    }
}

fn udp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn into_tokio(socket: Socket) -> io::Result<UdpSocket> {
    UdpSocket::from_std(socket.into())
}

/// Bind the group port with address reuse and join the group.
///
/// Several listeners on one host may share the port.
pub(crate) fn join_group(group: SocketAddr, config: &DiscoveryConfig) -> io::Result<UdpSocket> {
    let socket = udp_socket(&group)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    match group.ip() {
        IpAddr::V4(ip) => {
            let any = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port());
            socket.bind(&SockAddr::from(any))?;
            let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&ip, &interface)?;
            socket.set_multicast_loop_v4(config.multicast_loop)?;
        }
        IpAddr::V6(ip) => {
            socket.set_only_v6(true)?;
            let any = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), group.port());
            socket.bind(&SockAddr::from(any))?;
            socket.join_multicast_v6(&ip, 0)?;
            socket.set_multicast_loop_v6(config.multicast_loop)?;
        }
    }
    into_tokio(socket)
}

/// Open an unbound-port socket for sending to the group.
pub(crate) fn open_sender(group: SocketAddr, config: &DiscoveryConfig) -> io::Result<UdpSocket> {
    let socket = udp_socket(&group)?;
    match group.ip() {
        IpAddr::V4(_) => {
            socket.bind(&SockAddr::from(SocketAddr::new(
                Ipv4Addr::UNSPECIFIED.into(),
                0,
            )))?;
            socket.set_multicast_ttl_v4(config.multicast_ttl)?;
            socket.set_multicast_loop_v4(config.multicast_loop)?;
            if let Some(interface) = config.interface {
                socket.set_multicast_if_v4(&interface)?;
            }
        }
        IpAddr::V6(_) => {
            socket.bind(&SockAddr::from(SocketAddr::new(
                Ipv6Addr::UNSPECIFIED.into(),
                0,
            )))?;
            socket.set_multicast_hops_v6(config.multicast_ttl)?;
            socket.set_multicast_loop_v6(config.multicast_loop)?;
        }
    }
    into_tokio(socket)
}
