//! # Stream Loops
//!
//! Reader and writer halves shared by the client and every server session.
//! The reader splits the byte stream on EOT, decodes each frame and
//! dispatches it into the connection's inbound table. The writer drains a
//! queue of already encoded frames.

use crate::config::TransportConfig;
use crate::error::TransportError;
use bus_core::{CodecError, SubscriptionTable, WireCodec, EOT};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Encoded frames waiting for a writer. Bounded by
/// [`TransportConfig::send_queue_frames`].
pub(crate) type FrameSender = mpsc::Sender<Arc<[u8]>>;
pub(crate) type FrameReceiver = mpsc::Receiver<Arc<[u8]>>;

/// Queue for one socket.
pub(crate) fn frame_queue(config: &TransportConfig) -> (FrameSender, FrameReceiver) {
    mpsc::channel(config.queue_capacity())
}

/// Why a reader stopped.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// The peer closed its side.
    Eof,
    /// I/O failure or a corrupt frame.
    Failed(TransportError),
}

/// Splits a byte stream into EOT-terminated frames.
#[derive(Debug)]
pub(crate) struct FrameAccumulator {
    pending: Vec<u8>,
    max: usize,
}

impl FrameAccumulator {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            pending: Vec::new(),
            max,
        }
    }

    /// Append a chunk and return every frame it completed, EOT removed.
    pub(crate) fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let mut frames = Vec::new();
        while let Some(pos) = chunk.iter().position(|b| *b == EOT) {
            let mut frame = std::mem::take(&mut self.pending);
            frame.extend_from_slice(&chunk[..pos]);
            if frame.len() > self.max {
                return Err(CodecError::FrameTooLarge { max: self.max });
            }
            frames.push(frame);
            chunk = &chunk[pos + 1..];
        }
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > self.max {
            return Err(CodecError::FrameTooLarge { max: self.max });
        }
        Ok(frames)
    }

    /// Bytes received after the last EOT.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Read frames until EOF or failure, dispatching each decoded message.
pub(crate) async fn read_frames<R>(
    mut reader: R,
    codec: &WireCodec,
    table: &SubscriptionTable,
    config: &TransportConfig,
    peer: &str,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let mut frames = FrameAccumulator::new(config.max_frame_bytes);

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => n,
            Err(e) => return ReadOutcome::Failed(e.into()),
        };

        let complete = match frames.feed(&buf[..read]) {
            Ok(complete) => complete,
            Err(e) => return ReadOutcome::Failed(e.into()),
        };

        for frame in complete {
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let decoded = match codec.decode(&frame) {
                Ok(decoded) => decoded,
                Err(e) => return ReadOutcome::Failed(e.into()),
            };
            let report = table.dispatch(&decoded.message);
            trace!(
                peer = peer,
                message_id = decoded.message.message_id().unwrap_or("-"),
                matched = report.matched,
                "Frame received"
            );
        }
    }
}

/// Write queued frames until the queue's senders are gone.
pub(crate) async fn write_frames<W>(mut writer: W, mut frames: FrameReceiver) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    debug!("Frame queue closed, shutting down writer");
    writer.shutdown().await
}
