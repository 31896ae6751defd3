//! # Bus Configuration
//!
//! TOML file layout:
//!
//! ```toml
//! service = "prices"
//! codec = "STANDARD"                      # or "AES"
//! listen = ["socket://0.0.0.0:8800"]
//! connect = ["socket://10.0.0.7:8800"]
//! heartbeat_secs = 5                      # bus-node only, 0 disables
//!
//! [[discoverable]]
//! service = "prices"
//! group = "multicast://239.1.1.100:50100"
//!
//! [[discover]]
//! service = "quotes"
//! group = "multicast://239.1.1.100:50100"
//!
//! [transport]
//! connect_timeout_ms = 10000
//! read_buffer_size = 32768
//! max_frame_bytes = 1048576
//! close_linger_ms = 1000
//! send_queue_frames = 1024
//!
//! [discovery]
//! beacon_interval_ms = 1000
//! receive_timeout_ms = 1000
//! max_datagram_bytes = 2048
//! multicast_ttl = 1
//! multicast_loop = true
//! interface = "10.0.0.5"
//! ```
//!
//! Every key is optional. `BUS_LISTEN`, `BUS_CONNECT` (comma separated URIs)
//! and `BUS_CODEC` override the file.

use crate::error::ConfigError;
use bus_core::CodecKind;
use bus_discovery::DiscoveryConfig;
use bus_transport::{ConnectionUri, TransportConfig};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Configuration file structure.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    service: Option<String>,
    #[serde(default)]
    codec: CodecKind,
    #[serde(default)]
    listen: Vec<String>,
    #[serde(default)]
    connect: Vec<String>,
    #[serde(default)]
    discoverable: Vec<ServiceGroupFile>,
    #[serde(default)]
    discover: Vec<ServiceGroupFile>,
    heartbeat_secs: Option<u64>,
    #[serde(default)]
    transport: TransportFile,
    #[serde(default)]
    discovery: DiscoveryFile,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceGroupFile {
    service: String,
    group: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TransportFile {
    connect_timeout_ms: Option<u64>,
    read_buffer_size: Option<usize>,
    max_frame_bytes: Option<usize>,
    close_linger_ms: Option<u64>,
    send_queue_frames: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DiscoveryFile {
    beacon_interval_ms: Option<u64>,
    receive_timeout_ms: Option<u64>,
    max_datagram_bytes: Option<usize>,
    multicast_ttl: Option<u32>,
    multicast_loop: Option<bool>,
    interface: Option<Ipv4Addr>,
}

/// A service name paired with a discovery group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroup {
    pub service: String,
    pub group: ConnectionUri,
}

/// Validated bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Name of this process. A bus built from this configuration presets it
    /// as `_src` in [`crate::Bus::message_builder`].
    pub service: String,
    /// Codec for servers and static connections.
    pub codec: CodecKind,
    pub listen: Vec<ConnectionUri>,
    pub connect: Vec<ConnectionUri>,
    /// Services this process announces.
    pub discoverable: Vec<ServiceGroup>,
    /// Services this process looks for and connects to.
    pub discover: Vec<ServiceGroup>,
    /// Heartbeat period for the demo node; `None` disables it.
    pub heartbeat: Option<Duration>,
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service: "bus-node".to_string(),
            codec: CodecKind::Standard,
            listen: Vec::new(),
            connect: Vec::new(),
            discoverable: Vec::new(),
            discover: Vec::new(),
            heartbeat: None,
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

fn parse_uri(field: &'static str, value: &str) -> Result<ConnectionUri, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: bus_transport::TransportError| ConfigError::InvalidUri {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_uris(field: &'static str, values: &[String]) -> Result<Vec<ConnectionUri>, ConfigError> {
    values.iter().map(|v| parse_uri(field, v)).collect()
}

fn parse_groups(
    field: &'static str,
    groups: Vec<ServiceGroupFile>,
) -> Result<Vec<ServiceGroup>, ConfigError> {
    groups
        .into_iter()
        .map(|g| {
            Ok(ServiceGroup {
                group: parse_uri(field, &g.group)?,
                service: g.service,
            })
        })
        .collect()
}

fn comma_list(field: &'static str, value: &str) -> Result<Vec<ConnectionUri>, ConfigError> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_uri(field, part))
        .collect()
}

impl BusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error on invalid TOML, unknown keys or malformed URIs.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Self::default();

        let tf = file.transport;
        let td = defaults.transport;
        let transport = TransportConfig {
            connect_timeout: tf
                .connect_timeout_ms
                .map_or(td.connect_timeout, Duration::from_millis),
            read_buffer_size: tf.read_buffer_size.unwrap_or(td.read_buffer_size),
            max_frame_bytes: tf.max_frame_bytes.unwrap_or(td.max_frame_bytes),
            close_linger: tf
                .close_linger_ms
                .map_or(td.close_linger, Duration::from_millis),
            send_queue_frames: tf.send_queue_frames.unwrap_or(td.send_queue_frames),
        };

        let df = file.discovery;
        let dd = defaults.discovery;
        let discovery = DiscoveryConfig {
            beacon_interval: df
                .beacon_interval_ms
                .map_or(dd.beacon_interval, Duration::from_millis),
            receive_timeout: df
                .receive_timeout_ms
                .map_or(dd.receive_timeout, Duration::from_millis),
            max_datagram_bytes: df.max_datagram_bytes.unwrap_or(dd.max_datagram_bytes),
            multicast_ttl: df.multicast_ttl.unwrap_or(dd.multicast_ttl),
            multicast_loop: df.multicast_loop.unwrap_or(dd.multicast_loop),
            interface: df.interface.or(dd.interface),
        };

        Ok(Self {
            service: file.service.unwrap_or(defaults.service),
            codec: file.codec,
            listen: parse_uris("listen", &file.listen)?,
            connect: parse_uris("connect", &file.connect)?,
            discoverable: parse_groups("discoverable", file.discoverable)?,
            discover: parse_groups("discover", file.discover)?,
            heartbeat: file
                .heartbeat_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            transport,
            discovery,
        })
    }

    /// Apply `BUS_LISTEN`, `BUS_CONNECT` and `BUS_CODEC` from the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds a malformed URI or unknown codec.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(listen) = lookup("BUS_LISTEN") {
            self.listen = comma_list("BUS_LISTEN", &listen)?;
        }
        if let Some(connect) = lookup("BUS_CONNECT") {
            self.connect = comma_list("BUS_CONNECT", &connect)?;
        }
        if let Some(codec) = lookup("BUS_CODEC") {
            self.codec = codec
                .trim()
                .to_uppercase()
                .parse()
                .map_err(|e: bus_core::CodecError| ConfigError::Env {
                    var: "BUS_CODEC",
                    reason: e.to_string(),
                })?;
        }
        Ok(self)
    }
}
