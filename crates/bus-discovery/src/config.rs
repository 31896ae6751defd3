use std::net::Ipv4Addr;
use std::time::Duration;

/// Multicast discovery configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Time between two announcements.
    pub beacon_interval: Duration,
    /// Receive timeout; only bounds how long a listener sits in one `recv`.
    pub receive_timeout: Duration,
    /// Largest datagram read; longer ones are truncated and fail to parse.
    pub max_datagram_bytes: usize,
    /// Multicast TTL (IPv4) or hop limit (IPv6).
    pub multicast_ttl: u32,
    /// Deliver our own announcements to listeners on this host.
    pub multicast_loop: bool,
    /// IPv4 interface to join and send on; the OS default when `None`.
    pub interface: Option<Ipv4Addr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            max_datagram_bytes: 2048,
            multicast_ttl: 1,
            multicast_loop: true,
            interface: None,
        }
    }
}

impl DiscoveryConfig {
    /// Create config for testing with shorter timeouts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            beacon_interval: Duration::from_millis(100),
            receive_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }
}
