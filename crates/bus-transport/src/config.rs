use std::time::Duration;

/// Socket transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Outbound connect timeout, TLS handshake included.
    pub connect_timeout: Duration,
    /// Size of the per-socket read buffer.
    pub read_buffer_size: usize,
    /// Largest frame accepted before the stream is treated as corrupt.
    pub max_frame_bytes: usize,
    /// How long `close()` waits for queued frames to drain.
    pub close_linger: Duration,
    /// Frames that may wait for one socket before its peer is dropped.
    pub send_queue_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 32 * 1024,
            max_frame_bytes: 1024 * 1024,
            close_linger: Duration::from_secs(1),
            send_queue_frames: 1024,
        }
    }
}

impl TransportConfig {
    /// Capacity for a per-socket frame queue; zero is not a valid channel size.
    pub(crate) fn queue_capacity(&self) -> usize {
        self.send_queue_frames.max(1)
    }

    /// Create config for testing with shorter timeouts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_buffer_size: 4 * 1024,
            max_frame_bytes: 64 * 1024,
            close_linger: Duration::from_millis(200),
            send_queue_frames: 64,
        }
    }
}
